use thiserror::Error;

pub type Result<T = ()> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("pipeline error: {0}")]
    Pipeline(#[from] dbagent_pipeline::Error),
    #[error("ticker error: {0}")]
    Ticker(#[from] dbagent_ticker::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Map an HTTP client failure onto the error the sender reasons about.
///
/// Timeouts stay distinguishable; any other failure is a transport error
/// and makes the sender reconnect.
pub(crate) fn transport_error(err: reqwest::Error) -> dbagent_pipeline::Error {
    if err.is_timeout() {
        dbagent_pipeline::Error::Timeout(err.to_string())
    } else {
        dbagent_pipeline::Error::Transport(err.to_string())
    }
}
