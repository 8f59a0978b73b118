use thiserror::Error;
use tracing::{error, info, warn};

use crate::types::NodeName;

/// 顶层Raft错误类型
#[derive(Debug, Error)]
pub enum RaftError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Failures of the log / hard-state store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Log entry at index {0} not found")]
    LogNotFound(u64),

    #[error("Log entry at index {0} was compacted into a snapshot")]
    LogCompacted(u64),

    #[error("Corrupted data at index {0}")]
    DataCorruption(u64),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Consistency check failed: {0}")]
    Consistency(String),
}

/// 状态机应用相关错误
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("Invalid command at index {0}: {1}")]
    InvalidCommand(u64, String),

    #[error("State machine error: {0}")]
    Internal(String),
}

/// 快照相关错误
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("No snapshot available")]
    NotFound,

    #[error("Snapshot at index {0} is too old")]
    TooOld(u64),

    #[error("Snapshot installation already in progress")]
    InProgress,

    #[error("Snapshot data corrupted: {0}")]
    DataCorrupted(String),

    #[error("Snapshot stream error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced to callers of the engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("Not leading (current leader: {leader:?})")]
    NotLeading { leader: Option<NodeName> },

    #[error("Leadership lost before the command was committed")]
    LeadershipLost,

    #[error("Engine is shutting down")]
    ShuttingDown,

    #[error("Request timeout")]
    Timeout,

    #[error("Request conflicted: {0}")]
    Conflict(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Topology change rejected: {0}")]
    Topology(#[from] TopologyError),
}

/// Reasons a membership change cannot be proposed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("Another topology change is still in flight")]
    ChangeInProgress,

    #[error("Node {0} is already a member with the requested membership")]
    AlreadyMember(NodeName),

    #[error("Node {0} is not part of the topology")]
    UnknownNode(NodeName),

    #[error("Node {0} is not waiting for promotion")]
    NotPromotable(NodeName),

    #[error("Cannot remove the last voting node {0}")]
    LastVoter(NodeName),

    #[error("The leader cannot remove itself, step down first")]
    RemovingLeader,
}

/// Binary encoding failures (log entries, snapshot framing, payloads).
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Unexpected end of input")]
    UnexpectedEof,

    #[error("Varint is longer than 64 bits")]
    VarintOverflow,

    #[error("Invalid topology flag byte {0}")]
    InvalidFlag(u8),

    #[error("Expected {expected} entries, decoded {actual}")]
    EntryCountMismatch { expected: u64, actual: u64 },

    #[error("Snapshot stream ended before the terminating frame")]
    TruncatedSnapshot,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Binary payload error: {0}")]
    Binary(#[from] bincode::Error),
}

/// Outbound transport failures. Logged by the sender, never propagated into the engine.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timeout")]
    Timeout,

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Unexpected status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Transport is shutting down")]
    ShuttingDown,
}

/// Errors of the cluster management client and the administrative handler.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("No leader is currently known")]
    NoLeader,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Error response ({status}): {message}")]
    ErrorResponse { status: u16, message: String },
}

impl ClusterError {
    pub fn not_leading(&self) -> Option<&Option<NodeName>> {
        match self {
            ClusterError::Client(ClientError::NotLeading { leader }) => Some(leader),
            _ => None,
        }
    }
}

// === Error triage inside the engine loop ===
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorSeverity {
    /// The node must stop processing; persisted state can no longer be trusted.
    Fatal,
    Recoverable,
    Ignorable,
}

pub trait ErrorHandler {
    fn severity(&self) -> ErrorSeverity;
    fn context(&self) -> String;
}

impl ErrorHandler for StorageError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            StorageError::Io(_) => ErrorSeverity::Fatal,
            StorageError::LogNotFound(_) => ErrorSeverity::Recoverable,
            StorageError::LogCompacted(_) => ErrorSeverity::Recoverable,
            StorageError::DataCorruption(_) => ErrorSeverity::Fatal,
            StorageError::Serialization(_) => ErrorSeverity::Fatal,
            StorageError::Consistency(_) => ErrorSeverity::Fatal,
        }
    }

    fn context(&self) -> String {
        self.to_string()
    }
}

impl ErrorHandler for ApplyError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            ApplyError::InvalidCommand(_, _) => ErrorSeverity::Ignorable,
            ApplyError::Internal(_) => ErrorSeverity::Recoverable,
        }
    }

    fn context(&self) -> String {
        self.to_string()
    }
}

impl ErrorHandler for SnapshotError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            SnapshotError::NotFound => ErrorSeverity::Recoverable,
            SnapshotError::TooOld(_) => ErrorSeverity::Ignorable,
            SnapshotError::InProgress => ErrorSeverity::Recoverable,
            SnapshotError::DataCorrupted(_) => ErrorSeverity::Recoverable,
            SnapshotError::Io(_) => ErrorSeverity::Recoverable,
        }
    }

    fn context(&self) -> String {
        self.to_string()
    }
}

impl ErrorHandler for CodecError {
    fn severity(&self) -> ErrorSeverity {
        // Codec failures inside the loop only happen while decoding persisted payloads.
        ErrorSeverity::Fatal
    }

    fn context(&self) -> String {
        self.to_string()
    }
}

/// Applies [`ErrorSeverity`] triage to results produced by collaborators of the loop.
pub struct CallbackErrorHandler {
    node: NodeName,
    stopped: bool,
}

impl CallbackErrorHandler {
    pub fn new(node: NodeName) -> Self {
        Self {
            node,
            stopped: false,
        }
    }

    pub fn handle<T, E: ErrorHandler>(
        &mut self,
        result: Result<T, E>,
        operation: &str,
        target: Option<&str>,
    ) -> Option<T> {
        match result {
            Ok(val) => Some(val),
            Err(e) => {
                let ctx = match target {
                    Some(t) => format!("{} from {} to {}", operation, self.node, t),
                    None => format!("{} on {}", operation, self.node),
                };

                match e.severity() {
                    ErrorSeverity::Fatal => {
                        error!("[FATAL] {} failed: {} - stopping node", ctx, e.context());
                        self.stop();
                        None
                    }
                    ErrorSeverity::Recoverable => {
                        warn!("[RECOVERABLE] {} failed: {}", ctx, e.context());
                        None
                    }
                    ErrorSeverity::Ignorable => {
                        info!("[IGNORABLE] {} failed: {}", ctx, e.context());
                        None
                    }
                }
            }
        }
    }

    pub fn handle_void<E: ErrorHandler>(
        &mut self,
        result: Result<(), E>,
        operation: &str,
        target: Option<&str>,
    ) -> bool {
        self.handle(result, operation, target).is_some()
    }

    fn stop(&mut self) {
        if !self.stopped {
            error!(
                "Node {} stops processing messages due to a critical failure",
                self.node
            );
            self.stopped = true;
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}
