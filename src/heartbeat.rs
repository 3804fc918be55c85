//! Periodic liveness channel to the controller.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::api;
use crate::client::AgentTransport;

const INTERVAL: Duration = Duration::from_secs(60);

/// Endless heartbeat loop. Never fails the agent; it is dropped together
/// with the process.
pub async fn run(transport: Arc<dyn AgentTransport>, task_identification: api::TaskIdentification) {
    loop {
        debug!("sending heartbeat");
        let request = api::HeartbeatRequest {
            task_identification: Some(task_identification.clone()),
        };
        match transport.heartbeat(request).await {
            Ok(()) => debug!("sent heartbeat"),
            Err(status) => {
                warn!(error = %status, "failed to send heartbeat");
                // A transient transport failure would otherwise make the
                // next attempt wait out the accumulated backoff window.
                transport.reset_connection();
            }
        }
        tokio::time::sleep(INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{task_identification, FakeTransport};
    use std::sync::atomic::Ordering;

    #[tokio::test(start_paused = true)]
    async fn heartbeats_keep_coming() {
        let transport = FakeTransport::new();
        tokio::spawn(run(
            transport.clone() as Arc<dyn AgentTransport>,
            task_identification(),
        ));

        tokio::time::sleep(Duration::from_secs(150)).await;
        assert!(transport.heartbeats.load(Ordering::SeqCst) >= 2);
        assert_eq!(transport.connection_resets.load(Ordering::SeqCst), 0);
    }
}
