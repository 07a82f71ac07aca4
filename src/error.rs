#[derive(Debug, thiserror::Error)]
pub enum McInspectError {
    #[error("{0}")]
    Usage(String),

    #[error("I/O error talking to '{server}': {source}")]
    Io {
        server: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unexpected reply from '{server}': {reply}")]
    Protocol { server: String, reply: String },

    #[error("Server '{server}' rejected the command: {reply}")]
    Server { server: String, reply: String },

    #[error("Invalid key '{0}': keys are 1-250 bytes without spaces or control characters")]
    InvalidKey(String),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cannot write output: {0}")]
    Output(#[from] std::io::Error),
}

impl McInspectError {
    pub fn io(server: &str, source: std::io::Error) -> Self {
        McInspectError::Io {
            server: server.to_string(),
            source,
        }
    }

    pub fn protocol(server: &str, reply: impl Into<String>) -> Self {
        McInspectError::Protocol {
            server: server.to_string(),
            reply: reply.into(),
        }
    }

    /// True for failures the operator caused (bad action, missing arguments),
    /// which the binary answers with help text instead of an error message.
    pub fn is_usage(&self) -> bool {
        matches!(self, McInspectError::Usage(_))
    }
}

pub type Result<T, E = McInspectError> = std::result::Result<T, E>;
