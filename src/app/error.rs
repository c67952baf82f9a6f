use serde::Serialize;
use std::fmt;

pub const ERR_TIMEOUT: &str = "ERR_TIMEOUT";
pub const ERR_CONNECTION: &str = "ERR_CONNECTION";
pub const ERR_PERMISSION: &str = "ERR_PERMISSION";
pub const ERR_UNSUPPORTED: &str = "ERR_UNSUPPORTED";
pub const ERR_SYSTEM: &str = "ERR_SYSTEM";

#[derive(Debug, Clone, Serialize)]
pub struct AppError {
    pub error: String,
    pub code: String,
    pub trace_id: String,
}

impl AppError {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        trace_id: impl Into<String>,
    ) -> Self {
        Self {
            error: message.into(),
            code: code.into(),
            trace_id: trace_id.into(),
        }
    }

    pub fn timeout(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_TIMEOUT, message, trace_id)
    }

    pub fn connection(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_CONNECTION, message, trace_id)
    }

    pub fn permission(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_PERMISSION, message, trace_id)
    }

    pub fn unsupported(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_UNSUPPORTED, message, trace_id)
    }

    pub fn system(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_SYSTEM, message, trace_id)
    }

    pub fn is_timeout(&self) -> bool {
        self.code == ERR_TIMEOUT
    }

    pub fn is_connection(&self) -> bool {
        self.code == ERR_CONNECTION
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.error, self.code)
    }
}

impl std::error::Error for AppError {}
