use crate::types::DataType;

pub type Result<T> = std::result::Result<T, GradBusError>;

/// Errors surfaced by the device runtime facade and the reduction
/// kernels.
///
/// These are the only recoverable-looking seams in the crate; the
/// engine itself treats every failure that reaches it as fatal. Usage
/// errors (wrong device id, mismatched shapes, duplicate requests and
/// the like) indicate a program bug and abort with a message instead of
/// returning a value.
#[derive(Debug, thiserror::Error)]
pub enum GradBusError {
    #[error("unsupported data type {dtype} for {op}")]
    UnsupportedDType { dtype: DataType, op: &'static str },

    #[error("device runtime error: {message}")]
    Runtime {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl GradBusError {
    /// Create a `Runtime` error with just a message.
    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Runtime` error with a message and a source error.
    pub fn runtime_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Runtime {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }
}
