use std::fmt;

/// Closed error taxonomy surfaced to the orchestrator. Lower-level causes are
/// folded into the message with their full context chain; the variant is what
/// callers route on (retry vs. surface vs. ignore).
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutorError {
    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("image prepare failed ({stage}): {message}")]
    ImagePrepare { stage: PrepareStage, message: String },

    #[error("network prepare failed ({stage}): {message}")]
    NetworkPrepare { stage: NetworkStage, message: String },

    #[error("translate failed: {0}")]
    TranslateFailed(String),

    #[error("vmm binary not found: {0}")]
    VmmBinaryNotFound(String),

    #[error("vmm spawn failed: {0}")]
    VmmSpawn(String),

    #[error("vmm api unreachable: {0}")]
    VmmApiUnreachable(String),

    #[error("vmm api rejected {endpoint}: {message}")]
    VmmApiRejected { endpoint: String, message: String },

    #[error("vm not found: {0}")]
    VmNotFound(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("state persist failed: {0}")]
    StatePersist(String),
}

impl ExecutorError {
    pub fn image_prepare(stage: PrepareStage, err: impl fmt::Display) -> Self {
        ExecutorError::ImagePrepare {
            stage,
            message: format!("{err:#}"),
        }
    }

    pub fn network_prepare(stage: NetworkStage, err: impl fmt::Display) -> Self {
        ExecutorError::NetworkPrepare {
            stage,
            message: format!("{err:#}"),
        }
    }
}

/// Sub-cause of an image prepare failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareStage {
    NoRuntime,
    Pull,
    Export,
    Format,
    Copy,
    Rename,
}

impl fmt::Display for PrepareStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PrepareStage::NoRuntime => "no-runtime",
            PrepareStage::Pull => "pull",
            PrepareStage::Export => "export",
            PrepareStage::Format => "format",
            PrepareStage::Copy => "copy",
            PrepareStage::Rename => "rename",
        };
        f.write_str(s)
    }
}

/// Sub-cause of a network prepare failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStage {
    Bridge,
    Tap,
    Allocator,
}

impl fmt::Display for NetworkStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetworkStage::Bridge => "bridge",
            NetworkStage::Tap => "tap",
            NetworkStage::Allocator => "allocator",
        };
        f.write_str(s)
    }
}

pub type Result<T> = std::result::Result<T, ExecutorError>;
