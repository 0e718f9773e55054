use std::io;

pub type Result<T> = std::result::Result<T, BenchError>;

/// Every variant is fatal: the benchmark never retries and never degrades.
#[derive(Debug, thiserror::Error)]
pub enum BenchError {
    #[error("ConfigurationError: {0}")]
    Configuration(String),
    #[error("TransportSetupError: {context}: {source}")]
    TransportSetup {
        context: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("OperationError: work request {id} completed with status: {status}")]
    Operation { id: u64, status: String },
    #[error("ProtocolError: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl BenchError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn transport(context: &'static str, source: io::Error) -> Self {
        Self::TransportSetup { context, source }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}
