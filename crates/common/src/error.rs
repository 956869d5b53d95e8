use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("invalid tool schema `{name}`: {reason}")]
    InvalidToolSchema { name: String, reason: String },
}

impl Error {
    #[must_use]
    pub fn invalid_tool_schema(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidToolSchema {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
