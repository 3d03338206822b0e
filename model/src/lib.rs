//! Configuration data model for the log-metrics exporter.
//!
//! The YAML file is deserialized into the types in [`config`], credentials
//! missing from the file are filled in from the environment, and the result
//! is checked by [`validation`] before any pipeline component is built. The
//! configuration is immutable after load.

pub mod config;
pub mod validation;

pub use config::{
    CacheConfig, CloudIdentity, Config, Consumer, DatasourceConfig, DatasourceKind, DestField,
    EmulatorConfig, EnrichStep, ExportConfig, ExportStrategy, GeneralConfig, HostConfig,
    IdFieldStrategy, LastTimestampHostConfig, MetricConfig, MetricKind, MultiValueField,
    Operation, QueryConfig, UriProcessing,
};
pub use validation::CronPrecision;
