//! Error types for the WireGuard peer roster

use thiserror::Error;

/// Main error type for roster operations
#[derive(Error, Debug)]
pub enum RosterError {
    /// Referenced peer or credential directory does not exist
    #[error("Peer not found: {name}")]
    NotFound { name: String },

    /// A peer with this name already exists
    #[error("Peer already exists: {name}")]
    DuplicateName { name: String },

    /// Name cannot be used as a comment line or directory name
    #[error("Invalid peer name: {name:?}")]
    InvalidName { name: String },

    /// Every host address in the subnet is allocated
    #[error("No free address left in {subnet}")]
    SubnetExhausted { subnet: String },

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// System I/O errors
    #[error("System error: {0}")]
    System(#[from] std::io::Error),
}

/// Configuration document and settings errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Peer {name} is listed but its block cannot be located")]
    UnmatchedBlock { name: String },

    #[error("Invalid subnet: {value} (expected an IPv4 /24)")]
    InvalidSubnet { value: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Key generator failures. Never surfaced to callers; provisioning
/// substitutes placeholder keys instead.
#[derive(Error, Debug)]
pub enum KeygenError {
    #[error("Key tool unavailable: {tool}: {reason}")]
    ToolUnavailable { tool: String, reason: String },

    #[error("Key tool {tool} exited with {status}")]
    ToolFailed { tool: String, status: String },

    #[error("Key tool {tool} produced invalid output")]
    InvalidOutput { tool: String },
}

impl RosterError {
    /// Whether this error is the caller's fault (reported, never retried)
    pub fn is_caller_error(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::DuplicateName { .. } => true,
            Self::InvalidName { .. } => true,
            Self::SubnetExhausted { .. } => true,
            Self::Config(ConfigError::FileNotFound { .. }) => true,
            _ => false,
        }
    }

    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 1,
            Self::NotFound { .. } => 2,
            Self::DuplicateName { .. } | Self::InvalidName { .. } => 3,
            Self::SubnetExhausted { .. } => 4,
            Self::System(_) => 7,
        }
    }
}

/// Result type alias for roster operations
pub type Result<T> = std::result::Result<T, RosterError>;
