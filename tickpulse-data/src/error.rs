use thiserror::Error;

/// All errors generated in `tickpulse-data`.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("broker credentials missing or invalid: {0}")]
    Credentials(String),

    #[error("instrument not found in directory: {0}")]
    InstrumentNotFound(String),

    #[error("feed authority rejected stream authorization: {0}")]
    Authority(String),

    #[error("failed to initialise feed due to empty instrument set")]
    SubscriptionsEmpty,

    #[error("http transport: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("SocketError: {0}")]
    Socket(String),

    #[error("feed frame decode: {0}")]
    FrameDecode(#[from] prost::DecodeError),

    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl DataError {
    /// Determine if an error requires the feed connection to re-initialise.
    ///
    /// Single-frame decode failures are skippable; transport-level failures
    /// terminate the current connection and enter the backoff path.
    pub fn is_terminal(&self) -> bool {
        match self {
            DataError::Socket(error_msg) => {
                let error_lower = error_msg.to_lowercase();
                error_lower.contains("terminated")
                    || error_lower.contains("connectionclosed")
                    || error_lower.contains("alreadyclosed")
                    || error_lower.contains("sendafterclosing")
                    || error_lower.contains("io(")
                    || error_lower.contains("timeout")
            }
            DataError::Http(_) | DataError::Authority(_) => true,
            _ => false,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for DataError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Socket(value.to_string())
    }
}
