use thiserror::Error;

pub type Result<T = ()> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid metric type: {0}")]
    InvalidMetricType(String),
    #[error(
        "value lap: ts={penultimate_ts} val={penultimate:.6}, ts={previous_ts} val={previous:.6}, ts={ts} val={value:.6}"
    )]
    ValueLap {
        penultimate_ts: i64,
        penultimate: f64,
        previous_ts: i64,
        previous: f64,
        ts: i64,
        value: f64,
    },
    #[error("service already running: {0}")]
    ServiceAlreadyRunning(String),
    #[error("service registration error: {0}")]
    ServiceRegistration(String),
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
    #[error("invalid service config: {0}")]
    InvalidConfig(String),
    #[error("failed to connect to {target} after {tries} tries: {source}")]
    ConnectFailed {
        target: String,
        tries: u32,
        #[source]
        source: Box<Error>,
    },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("not connected")]
    NotConnected,
    #[error("no response pending")]
    NoResponse,
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("received unhandled response code from API: {code}: {error}")]
    UnhandledResponse { code: u16, error: String },
    #[error("received unknown response code from API: {code}: {error}")]
    UnknownResponse { code: u16, error: String },
    #[error("spool error: {0}")]
    Spool(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
