use thiserror::Error;

/// Structural failures abort the current run but leave the workspace
/// resumable. Everything else the tick loop materializes into the tape or
/// registers instead of propagating.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("workspace lock held by pid {0}")]
    LockHeld(i32),

    #[error("pointer escapes workspace: {0}")]
    PathEscape(String),

    #[error("oracle produced no valid transition after {0} attempts")]
    OracleInvalid(u32),

    #[error("insanity loop: last {0} oracle outputs were identical")]
    InsanityLoop(usize),

    #[error("run already active for this workspace")]
    AlreadyRunning,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
