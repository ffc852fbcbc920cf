use std::fmt;

/// Errors surfaced by [`crate::registry::BackendRegistry`] operations.
#[derive(Debug)]
pub enum RegistryError {
    /// The backing store (in-memory lock or external KV client) is unavailable.
    StoreUnavailable(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::StoreUnavailable(msg) => write!(f, "registry store unavailable: {msg}"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Errors surfaced while forwarding a request upstream.
#[derive(Debug)]
pub enum ForwardError {
    NoBackend,
    GateRejected,
    Timeout,
    Upstream(String),
}

impl fmt::Display for ForwardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardError::NoBackend => write!(f, "no backend servers registered"),
            ForwardError::GateRejected => write!(f, "backend temporarily unavailable"),
            ForwardError::Timeout => write!(f, "upstream request timed out"),
            ForwardError::Upstream(msg) => write!(f, "upstream error: {msg}"),
        }
    }
}

impl std::error::Error for ForwardError {}

/// Errors surfaced while reading configuration from the environment.
#[derive(Debug)]
pub enum ConfigError {
    InvalidValue { var: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidValue { var, value } => {
                write!(f, "invalid value for {var}: {value:?}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
