//! Local-port readiness probing used before the build starts.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{sleep, Instant};
use tracing::info;

/// Wait until something is listening on `127.0.0.1:<port>`, up to `timeout`.
/// Returns `true` when a listener appeared in time.
pub async fn wait_for_local_port(port: u16, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;

    loop {
        match TcpStream::connect(("127.0.0.1", port)).await {
            Ok(_) => {
                info!(port, "port is ready");
                return true;
            }
            Err(_) if Instant::now() >= deadline => return false,
            Err(_) => sleep(Duration::from_secs(1)).await,
        }
    }
}
