pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Admission refused: the queue is full and holds no lower-priority
    /// victim. The packet was dropped and counted.
    #[error("transmit queue full")]
    QueueFull,
    /// A rate regulator needs a clock whose frequency is known.
    #[error("machine clock frequency unavailable")]
    ClockUnavailable,
    #[error("config error: {0}")]
    ConfigError(String),
    #[error("Encounter IO error, {0}")]
    IoError(#[from] std::io::Error),
}
