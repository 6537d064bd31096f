#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use diag_server::{Server, ServerError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const LOCALHOST: &str = "127.0.0.1:0";

static TRACING_INIT: Once = Once::new();
pub fn setup_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_writer(tracing_subscriber::fmt::TestWriter::new())
            .init()
    });
}

pub struct ServerHandle {
    pub server: Arc<Server>,
    pub addr: SocketAddr,
    pub token: CancellationToken,
    pub task: JoinHandle<Result<(), ServerError>>,
}

impl ServerHandle {
    /// Start `server` in the background and wait until it is listening.
    pub async fn start(server: Server) -> Self {
        setup_tracing();

        let server = Arc::new(server);
        let token = CancellationToken::new();
        let task = {
            let server = server.clone();
            let token = token.clone();
            tokio::spawn(async move { server.start(token).await })
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        let addr = loop {
            if let Some(addr) = server.local_addr() {
                break addr;
            }
            assert!(Instant::now() < deadline, "server never started listening");
            tokio::time::sleep(Duration::from_millis(10)).await;
        };

        Self {
            server,
            addr,
            token,
            task,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        reqwest::get(self.url(path))
            .await
            .expect("failed to send request")
    }

    pub async fn get_text(&self, path: &str) -> String {
        self.get(path)
            .await
            .text()
            .await
            .expect("failed to read response body")
    }

    /// Cancel the server's context and wait for `start` to return.
    pub async fn stop(self) -> Result<(), ServerError> {
        self.token.cancel();
        self.task.await.expect("server task panicked")
    }
}

pub async fn assert_or_retry<F>(check: F)
where
    F: Fn() -> bool,
{
    assert_or_retry_for_duration(check, Duration::from_secs(5)).await
}

pub async fn assert_or_retry_for_duration<F>(check: F, timeout: Duration)
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + timeout;
    while !check() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(check())
}
