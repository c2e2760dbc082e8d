/// Error types for the daemon's thin HTTP front end.
use thiserror::Error;

pub type DaemonResult<T> = Result<T, DaemonError>;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("failed to bind {0}: {1}")]
    Bind(std::net::SocketAddr, std::io::Error),

    #[error("server error: {0}")]
    Server(String),
}
