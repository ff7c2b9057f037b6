use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Every failure the core surfaces. Structural and invariant violations roll
/// the enclosing transaction back; no retries happen below the caller.
#[derive(Debug, Error)]
pub enum Error {
    #[error("manager is not running")]
    NotRunning,

    #[error("manager is already running")]
    Running,

    #[error("manager is destroyed")]
    Destroyed,

    #[error("unsupported key size: {0} bits")]
    KeyDerivationInvalid(usize),

    /// Authenticated decryption returned bottom. Never swallowed silently.
    #[error("block decryption failed")]
    AeadFailed,

    #[error("inode {ino} is not a {expected}")]
    TypeMismatch { ino: u64, expected: &'static str },

    #[error("no such entry")]
    NotFound,

    #[error("inode {0} does not exist")]
    IndexMissing(u64),

    #[error("parent inode {0} does not exist")]
    ParentMissing(u64),

    #[error("invalid entry name: {0:?}")]
    InvalidName(String),

    #[error("directory {0} still has entries")]
    NotEmpty(u64),

    #[error("filesystem root already exists")]
    DuplicateRoot,

    #[error("transaction has already committed")]
    TxCommitted,

    #[error("transaction has rolled back")]
    TxRolledBack,

    #[error("transaction has not committed")]
    TxNotCommitted,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A stored structured record failed strict JSON parsing.
    #[error("record parse failed: {0}")]
    Parse(#[from] serde_json::Error),

    /// Any error surfaced by the underlying KV engine.
    #[error("kv engine: {0}")]
    Transport(String),
}
