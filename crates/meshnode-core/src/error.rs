//! Error types for the node core.

use thiserror::Error;

/// Node error type
#[derive(Error, Debug)]
pub enum NodeError {
    /// Frame too short or otherwise not a packet
    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    /// Payload does not match the layout its command expects
    #[error("malformed payload for command 0x{command:02x}: {reason}")]
    MalformedPayload {
        /// Command byte of the offending packet
        command: u8,
        /// What was wrong with it
        reason: String,
    },

    /// Configuration is missing or has the wrong shape
    #[error("configuration error: {0}")]
    Config(String),

    /// A module could not be constructed
    #[error("module '{name}' failed to start: {reason}")]
    ModuleInit {
        /// Registry name of the module
        name: String,
        /// Why construction failed
        reason: String,
    },

    /// A module is not available (not constructed, or busy)
    #[error("module unavailable: {0}")]
    ModuleUnavailable(String),

    /// A module does not support the requested action
    #[error("module '{module}' does not support action {action}")]
    UnsupportedAction {
        /// Target module
        module: String,
        /// Requested action
        action: String,
    },

    /// Device driver failure
    #[error("device '{device}' error: {reason}")]
    Device {
        /// Device key in the hardware configuration
        device: String,
        /// Driver-reported failure
        reason: String,
    },

    /// An event subscriber failed
    #[error("subscriber for '{topic}' failed: {reason}")]
    Subscriber {
        /// Topic being delivered
        topic: String,
        /// Failure reported by the subscriber
        reason: String,
    },

    /// Parameter table is not a bijection
    #[error("duplicate parameter mapping: {0}")]
    DuplicateParameter(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl NodeError {
    /// Shorthand for a device failure
    pub fn device(device: impl Into<String>, reason: impl Into<String>) -> Self {
        NodeError::Device {
            device: device.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a module construction failure
    pub fn module_init(name: impl Into<String>, reason: impl Into<String>) -> Self {
        NodeError::ModuleInit {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for node operations
pub type Result<T> = std::result::Result<T, NodeError>;
