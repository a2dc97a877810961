// Helpers for tests that need a real server on ephemeral ports

use crate::config::{ServerOption, with_grpc_port, with_hostname, with_http_port, with_logger};
use crate::error::ServerError;
use crate::logger;
use crate::server::Server;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;

pub const TEST_SERVER_NAME: &str = "test_server";

const READY_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Builds a server on `localhost` with both ports set to 0 and logging
/// disabled. Options passed in are applied afterwards, so they may override
/// the defaults.
pub fn new_for_tests<I>(options: I) -> Result<Server, ServerError>
where
    I: IntoIterator<Item = ServerOption>,
{
    let defaults = [
        with_hostname("localhost"),
        with_http_port(0),
        with_grpc_port(0),
        with_logger(logger::disabled()),
    ];
    Server::new(TEST_SERVER_NAME, defaults.into_iter().chain(options))
}

/// Starts `server` and waits until both listeners accept TCP connections and
/// the readiness flag is up.
pub async fn start_for_tests(server: &Server) -> Result<(), ServerError> {
    server.start().await?;

    let (Some(http), Some(grpc)) = (server.http_socket_addr(), server.grpc_socket_addr()) else {
        return Err(ServerError::config("server started without bound addresses"));
    };

    let deadline = tokio::time::Instant::now() + READY_TIMEOUT;
    loop {
        if server.is_ready() && accepts(http).await && accepts(grpc).await {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(ServerError::config(format!(
                "server not ready within {:?} (state {})",
                READY_TIMEOUT,
                server.state()
            )));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn accepts(address: SocketAddr) -> bool {
    TcpStream::connect(address).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_for_tests_waits_for_readiness() {
        let server = new_for_tests([]).unwrap();
        start_for_tests(&server).await.unwrap();

        assert!(server.is_ready());
        assert!(server.http_address().unwrap().starts_with("http://localhost:"));
        assert_ne!(server.http_socket_addr().unwrap().port(), 0);

        server.close().await.unwrap();
    }
}
