use exporter::api::{self, Emulator};
use exporter::arguments::Arguments;
use exporter::enrich::Enricher;
use exporter::evaluator::Evaluator;
use exporter::metrics::MetricCollectors;
use exporter::pipeline::Pipeline;
use exporter::scheduler::Scheduler;
use model::{validation, Config, Consumer};
use shared::queues::{
    DataQueue, MetricsQueue, ScheduleQueue, DATA_QUEUE, METRICS_QUEUE, SCHEDULE_QUEUE,
};
use shared::registry::QueryRegistry;
use shared::selfmonitor::SelfMonitor;
use shared::sinks::{MetricsSink, RemoteWriteSink, VictoriaSink};
use shared::sources::{self, LastTimestampClient};
use shared::{codes, SELF_METRICS};
use std::net::SocketAddr;
use std::sync::Arc;
use structopt::StructOpt;

fn version() -> String {
    format!("log-exporter {}", env!("CARGO_PKG_VERSION"))
}

#[tokio::main]
async fn main() {
    let mut args = Arguments::from_args();
    if args.version {
        println!("{}", version());
        return;
    }

    if let Err(err) =
        shared::tracing::initialize(&args.log_level, args.log_format, args.log_path.as_deref())
    {
        eprintln!("failed to initialize logging: {:#}", err);
        std::process::exit(1);
    }

    if args.check_config {
        check_config_and_exit(&args);
    }

    tracing::info!("log-exporter started; {}", version());

    let mut config = match Config::read(&args.config_path) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error_code = codes::LME_8101, err = %format!("{:#}", err), "fatal configuration error");
            std::process::exit(1);
        }
    };
    args.apply_config_flags(&config.flags.clone());

    match validation::validate(&config, args.croniter_precision) {
        Ok(warnings) => {
            for warning in warnings {
                tracing::error!(error_code = codes::LME_8102, warning = %warning, "configuration inconsistency");
            }
        }
        Err(err) => {
            tracing::error!(error_code = codes::LME_8101, err = %format!("{:#}", err), "fatal configuration error");
            std::process::exit(1);
        }
    }

    let pull_address = resolve_pull_address(&config, &args);
    let push_export = config.push_export().map(|(name, export)| (name.clone(), export.clone()));
    let config = Arc::new(config);

    let registry = Arc::new(QueryRegistry::new(config.queries.keys().map(String::as_str)));
    let monitor = match SelfMonitor::new(&config.datasource().labels, args.disable_timestamp) {
        Ok(monitor) => Arc::new(monitor),
        Err(err) => {
            tracing::error!(error_code = codes::LME_8101, %err, "failed to create self metrics");
            std::process::exit(1);
        }
    };
    if !args.disable_self_monitor {
        if let Err(err) = monitor.register_into(&registry) {
            tracing::error!(error_code = codes::LME_8101, %err, "failed to register self metrics");
            std::process::exit(1);
        }
        monitor.prime_enrich_counters(&config);
    }

    let mut sink: Option<Arc<dyn MetricsSink>> = None;
    let mut last_timestamp = None;
    if let Some((export_name, export)) = &push_export {
        tracing::info!(export = %export_name, consumer = ?export.consumer, "initializing push sink");
        let built: anyhow::Result<Arc<dyn MetricsSink>> = match export.consumer {
            Consumer::VictoriaVmagent => {
                VictoriaSink::new(export).map(|sink| Arc::new(sink) as Arc<dyn MetricsSink>)
            }
            Consumer::PrometheusRemoteWrite => {
                RemoteWriteSink::new(export).map(|sink| Arc::new(sink) as Arc<dyn MetricsSink>)
            }
        };
        match built {
            Ok(built) => sink = Some(built),
            Err(err) => {
                tracing::error!(error_code = codes::LME_8101, err = %format!("{:#}", err), "failed to build the push sink");
                std::process::exit(1);
            }
        }
        if let Some(lts_config) = &export.last_timestamp_host {
            match LastTimestampClient::new(lts_config) {
                Ok(client) => last_timestamp = Some(Arc::new(client)),
                Err(err) => tracing::error!(
                    error_code = codes::LME_8102,
                    err = %format!("{:#}", err),
                    "failed to build the last-timestamp client, history is disabled",
                ),
            }
        }
    }
    if pull_address.is_none() && sink.is_none() {
        tracing::error!(
            error_code = codes::LME_8101,
            "neither pull nor push strategy is defined, exiting",
        );
        std::process::exit(1);
    }

    let schedule_queue = Arc::new(ScheduleQueue::new(
        SCHEDULE_QUEUE,
        config
            .queries
            .iter()
            .map(|(name, query)| (name.clone(), query.schedule_queue_size())),
        monitor.clone(),
    ));
    let data_queue = Arc::new(DataQueue::new(
        DATA_QUEUE,
        config
            .queries
            .iter()
            .map(|(name, query)| (name.clone(), query.data_queue_size())),
        monitor.clone(),
    ));
    let metrics_queue = sink.is_some().then(|| {
        Arc::new(MetricsQueue::new(
            METRICS_QUEUE,
            config
                .queries
                .iter()
                .map(|(name, query)| (name.clone(), query.metrics_queue_size()))
                .chain(std::iter::once((
                    SELF_METRICS.to_string(),
                    config.general.self_mon_queue_size(),
                ))),
            monitor.clone(),
        ))
    });

    let source = match sources::create(config.clone(), monitor.clone()) {
        Ok(source) => source,
        Err(err) => {
            tracing::error!(error_code = codes::LME_8101, err = %format!("{:#}", err), "failed to build the datasource client");
            std::process::exit(1);
        }
    };
    let collectors = match MetricCollectors::new(&config, &registry) {
        Ok(collectors) => Arc::new(collectors),
        Err(err) => {
            tracing::error!(error_code = codes::LME_8101, err = %format!("{:#}", err), "failed to register metric collectors");
            std::process::exit(1);
        }
    };
    let evaluator =
        Arc::new(Evaluator::new(config.clone(), monitor.clone(), args.disable_timestamp));
    let enricher = Arc::new(Enricher::new(&config, monitor.clone()));

    let scheduler = Arc::new(Scheduler::new(
        config.clone(),
        args.croniter_precision,
        schedule_queue.clone(),
        last_timestamp,
    ));
    scheduler.start();

    let pipeline = Pipeline {
        config: config.clone(),
        source,
        enricher,
        evaluator,
        collectors,
        registry: registry.clone(),
        schedule_queue,
        data_queue,
        metrics_queue,
        sink,
        monitor,
    };
    pipeline.start();
    if !args.disable_self_monitor {
        pipeline.start_self_monitor_schedule(args.croniter_precision);
    }

    let emulator = config.emulator.clone().and_then(Emulator::new);
    match pull_address {
        Some(address) => {
            tracing::info!(%address, "serving metrics");
            let routes = api::routes(registry, emulator);
            tokio::select! {
                _ = warp::serve(routes).run(address) => {
                    tracing::error!(error_code = codes::LME_1606, "http server exited");
                }
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        None => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
    tracing::info!("log-exporter stopped");
}

fn resolve_pull_address(config: &Config, args: &Arguments) -> Option<SocketAddr> {
    if let Some((export_name, export)) = config.pull_export() {
        if let Some(port) = export.port {
            tracing::info!(export = %export_name, port, "pull export will expose metrics");
            return Some(SocketAddr::from(([0, 0, 0, 0], port)));
        }
    }
    args.listen_address
}

fn check_config_and_exit(args: &Arguments) -> ! {
    tracing::info!("log-exporter started with option --check-config");
    let config = match Config::read(&args.config_path) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error_code = codes::LME_8101, err = %format!("{:#}", err), "error reading yaml config");
            tracing::error!(error_code = codes::LME_8100, "yaml config is invalid");
            std::process::exit(1);
        }
    };
    match validation::validate(&config, args.croniter_precision) {
        Ok(warnings) => {
            for warning in warnings {
                tracing::warn!(warning = %warning, "configuration inconsistency");
            }
            tracing::info!("log-exporter is able to start with the provided configuration");
            std::process::exit(0);
        }
        Err(err) => {
            tracing::error!(error_code = codes::LME_8101, err = %format!("{:#}", err), "yaml config is invalid");
            std::process::exit(1);
        }
    }
}
