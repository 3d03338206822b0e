//! Error-code taxonomy attached to structured log events.
//!
//! Codes are grouped by the first digit: 1xxx internal logic, 7xxx remote
//! system interaction (one range per backend), 8xxx configuration. Operators
//! route alerts on the `error_code` field, so the scheme is load-bearing.

/// Log field name carrying the code.
pub const FIELD: &str = "error_code";

// Prometheus client errors
pub const LME_1001: &str = "LME-1001"; // counter update error
pub const LME_1002: &str = "LME-1002"; // gauge update error
pub const LME_1003: &str = "LME-1003"; // histogram update error
pub const LME_1005: &str = "LME-1005"; // registry gather error

// Enrichment errors
pub const LME_1010: &str = "LME-1010"; // column insert error
pub const LME_1011: &str = "LME-1011"; // value evaluation error

// Metric evaluation errors
pub const LME_1020: &str = "LME-1020"; // general metric evaluation error

// Metric format conversion errors
pub const LME_1041: &str = "LME-1041"; // metric family to text conversion error
pub const LME_1042: &str = "LME-1042"; // metric family to remote-write conversion error

// Internal technical errors
pub const LME_1601: &str = "LME-1601"; // unexpected panic
pub const LME_1604: &str = "LME-1604"; // unexpected nil or empty object
pub const LME_1605: &str = "LME-1605"; // emulator technical error
pub const LME_1606: &str = "LME-1606"; // unexpected HTTP server error
pub const LME_1608: &str = "LME-1608"; // cron registration error
pub const LME_1609: &str = "LME-1609"; // numeric conversion error

// Queue errors
pub const LME_1621: &str = "LME-1621"; // read from a closed queue
pub const LME_1622: &str = "LME-1622"; // write to a closed queue
pub const LME_1624: &str = "LME-1624"; // write to a non-existent queue
pub const LME_1625: &str = "LME-1625"; // write to a full queue

// Graylog communication
pub const LME_7100: &str = "LME-7100"; // general communication error
pub const LME_7101: &str = "LME-7101"; // error status code
pub const LME_7102: &str = "LME-7102"; // unexpected status code
pub const LME_7103: &str = "LME-7103"; // response parsing error

// Victoria communication
pub const LME_7110: &str = "LME-7110"; // general communication error
pub const LME_7111: &str = "LME-7111"; // error status code
pub const LME_7113: &str = "LME-7113"; // response parsing error

// Prometheus remote write communication
pub const LME_7120: &str = "LME-7120"; // general communication error
pub const LME_7122: &str = "LME-7122"; // unexpected status code

// Last timestamp service communication
pub const LME_7130: &str = "LME-7130"; // general communication error
pub const LME_7131: &str = "LME-7131"; // error status code
pub const LME_7133: &str = "LME-7133"; // response parsing error
pub const LME_7134: &str = "LME-7134"; // response is not supported

// New Relic communication
pub const LME_7140: &str = "LME-7140"; // general communication error
pub const LME_7141: &str = "LME-7141"; // error status code
pub const LME_7142: &str = "LME-7142"; // unexpected status code
pub const LME_7143: &str = "LME-7143"; // response parsing error
pub const LME_7144: &str = "LME-7144"; // response is not supported

// Configuration
pub const LME_8100: &str = "LME-8100"; // general configuration error
pub const LME_8101: &str = "LME-8101"; // fatal configuration error, cannot start
pub const LME_8102: &str = "LME-8102"; // non-fatal configuration inconsistency
pub const LME_8104: &str = "LME-8104"; // bad parameter value, default applied
pub const LME_8106: &str = "LME-8106"; // incorrect emulator configuration
