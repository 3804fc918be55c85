//! Per-command log uploader.
//!
//! Every step gets its own uploader; bytes written to it are buffered,
//! masked against the sensitive-value set and shipped to the controller in
//! chunks. Foreground steps finalise the uploader synchronously at step
//! end; background scripts keep theirs alive until task teardown.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::api;
use crate::client::AgentTransport;
use crate::environment::SensitiveValues;

const MASK: &str = "***";

/// Flush eagerly once this much output has accumulated.
const CHUNK_SIZE: usize = 64 * 1024;

/// Replace every sensitive value occurring in `text` with a fixed mask.
pub fn mask_text(text: &str, sensitive: &HashSet<String>) -> String {
    let mut masked = text.to_string();
    for secret in sensitive {
        if !secret.is_empty() && masked.contains(secret.as_str()) {
            masked = masked.replace(secret.as_str(), MASK);
        }
    }
    masked
}

pub struct LogUploader {
    transport: Arc<dyn AgentTransport>,
    task_identification: api::TaskIdentification,
    command_name: String,
    sensitive: SensitiveValues,
    buffer: Mutex<Vec<u8>>,
    finalized: AtomicBool,
}

impl LogUploader {
    pub fn new(
        transport: Arc<dyn AgentTransport>,
        task_identification: api::TaskIdentification,
        command_name: impl Into<String>,
        sensitive: SensitiveValues,
    ) -> Self {
        Self {
            transport,
            task_identification,
            command_name: command_name.into(),
            sensitive,
            buffer: Mutex::new(Vec::new()),
            finalized: AtomicBool::new(false),
        }
    }

    pub fn command_name(&self) -> &str {
        &self.command_name
    }

    /// Append raw output. Masking happens at transmission time so values
    /// that become sensitive later in the step are still honoured.
    pub fn write_bytes(&self, bytes: &[u8]) {
        if self.finalized.load(Ordering::SeqCst) {
            return;
        }
        self.buffer.lock().extend_from_slice(bytes);
    }

    pub fn write_line(&self, line: impl AsRef<str>) {
        self.write_bytes(line.as_ref().as_bytes());
        self.write_bytes(b"\n");
    }

    pub fn pending_len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn wants_flush(&self) -> bool {
        self.pending_len() >= CHUNK_SIZE
    }

    /// Drain the buffer, mask it and ship one chunk to the controller.
    /// Upload failures are logged and dropped; losing a log chunk must not
    /// fail the step.
    pub async fn flush(&self) {
        let pending = {
            let mut buffer = self.buffer.lock();
            if buffer.is_empty() {
                return;
            }
            std::mem::take(&mut *buffer)
        };

        let masked = {
            let sensitive = match self.sensitive.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            mask_text(&String::from_utf8_lossy(&pending), &sensitive)
        };

        let request = api::ReportCommandLogsRequest {
            task_identification: Some(self.task_identification.clone()),
            command_name: self.command_name.clone(),
            data: masked.into_bytes(),
        };
        if let Err(status) = self.transport.report_command_logs(request).await {
            tracing::warn!(
                command = %self.command_name,
                error = %status,
                "failed to upload a log chunk"
            );
        }
    }

    /// Flush any trailing output and close the uploader. Safe to call more
    /// than once; only the first call ships the trailing chunk.
    pub async fn finalize(&self) {
        self.flush().await;
        self.finalized.store(true, Ordering::SeqCst);
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_text_replaces_every_occurrence() {
        let mut sensitive = HashSet::new();
        sensitive.insert("s3cr3t".to_string());

        assert_eq!(
            mask_text("Running s3cr3t and again s3cr3t", &sensitive),
            "Running *** and again ***"
        );
    }

    #[test]
    fn mask_text_ignores_empty_secrets() {
        let mut sensitive = HashSet::new();
        sensitive.insert(String::new());

        assert_eq!(mask_text("plain output", &sensitive), "plain output");
    }

    #[test]
    fn mask_text_handles_multiple_secrets() {
        let mut sensitive = HashSet::new();
        sensitive.insert("alpha".to_string());
        sensitive.insert("beta".to_string());

        let masked = mask_text("alpha then beta", &sensitive);
        assert_eq!(masked, "*** then ***");
    }
}
