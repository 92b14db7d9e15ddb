use thiserror::Error;

use crate::application::repos::RepoError;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
    #[error("could not acquire lock for `{key}` after {attempts} attempts")]
    LockTimeout { key: String, attempts: u32 },
    #[error("cache loader failed: {0}")]
    Loader(#[from] RepoError),
    #[error("failed to decode cached value for `{key}`: {message}")]
    Decode { key: String, message: String },
    #[error("failed to encode value for `{key}`: {message}")]
    Encode { key: String, message: String },
}

impl CacheError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    pub(crate) fn decode(key: &str, message: impl ToString) -> Self {
        Self::Decode {
            key: key.to_string(),
            message: message.to_string(),
        }
    }

    pub(crate) fn encode(key: &str, message: impl ToString) -> Self {
        Self::Encode {
            key: key.to_string(),
            message: message.to_string(),
        }
    }
}
