use thiserror::Error;

/// Failures that end a [`Server::start`](crate::Server::start) run.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },
    #[error("serving diagnostics endpoints failed: {0}")]
    Serve(#[source] std::io::Error),
    #[error("serving task failed: {0}")]
    ServeTask(#[from] tokio::task::JoinError),
}
