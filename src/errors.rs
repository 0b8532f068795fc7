use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("CONFIG_INVALID: {0}")]
    Config(String),
    #[error("UNAUTHORIZED: {0}")]
    Unauthorized(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("TOKEN_REFRESH_FAILED: {0}")]
    TokenRefresh(String),
    #[error("UPSTREAM_{status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("CRYPTO_FAILURE: {0}")]
    Crypto(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("DATABASE: {0}")]
    Database(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    pub fn upstream(status: u16, body: impl Into<String>) -> Self {
        Self::Upstream {
            status,
            body: body.into(),
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Database(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Config(value.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
