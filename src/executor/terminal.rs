//! Remote-terminal wrapper.
//!
//! When a task contains a wait-for-terminal step, the wrapper is started
//! ahead of the per-step loop and owns the expiry window. The concrete
//! terminal protocol is out of scope for the agent; the wrapper surfaces
//! an operation stream the dispatcher mirrors into the step's log.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub enum Operation {
    /// Progress line to mirror into the step log.
    Log(String),
    /// Terminal session ended; fixes the step's success flag.
    Exit { success: bool },
}

pub struct TerminalWrapper {
    operations: Mutex<mpsc::Receiver<Operation>>,
}

impl TerminalWrapper {
    pub fn new(
        token: CancellationToken,
        server_address: String,
        expire_in: Duration,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(16);

        tokio::spawn(async move {
            let _ = sender
                .send(Operation::Log(format!(
                    "Waiting for the remote terminal session via {server_address} \
                     (expires in {} seconds)...",
                    expire_in.as_secs()
                )))
                .await;

            tokio::select! {
                _ = tokio::time::sleep(expire_in) => {
                    let _ = sender
                        .send(Operation::Log(
                            "Terminal session expiration window lapsed.".to_string(),
                        ))
                        .await;
                    let _ = sender.send(Operation::Exit { success: true }).await;
                }
                _ = token.cancelled() => {
                    let _ = sender.send(Operation::Exit { success: false }).await;
                }
            }
        });

        Self {
            operations: Mutex::new(receiver),
        }
    }

    /// Next operation, or `None` once the wrapper task is gone.
    pub async fn next_operation(&self) -> Option<Operation> {
        self.operations.lock().await.recv().await
    }
}
