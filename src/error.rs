use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("unable to initialize trap, check manager is disabled")]
    ManagerDisabled,
    #[error("no eligible broker: {0}")]
    NoEligibleBroker(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("random source unavailable: {0}")]
    RandomSource(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("check {0} is not active")]
    InactiveCheck(String),
    #[error("invalid trap url: {0}")]
    InvalidTrapUrl(String),
    #[error("designated broker {0} is invalid (not active, does not support required check type, or connectivity issue)")]
    InvalidBroker(String),
}

impl Error {
    /// Lookup misses fall through to the next resolution step instead of
    /// surfacing to the caller.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Backend(format!("request timed out: {err}"))
        } else {
            Error::Backend(err.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Backend(format!("JSON serialization/deserialization error: {err}"))
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::InvalidConfig(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::InvalidConfig(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
