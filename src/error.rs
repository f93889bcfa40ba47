use thiserror::Error;

#[derive(Error, Debug)]
pub enum CorralError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Command '{name}' failed ({kind}): {message}")]
    Command {
        name: String,
        kind: String,
        message: String,
    },

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Call timed out")]
    Timeout,

    #[error("Worker lost: {0}")]
    WorkerLost(String),

    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    #[error("Pool is not running")]
    PoolStopped,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, CorralError>;
