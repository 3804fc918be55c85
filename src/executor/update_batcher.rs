//! Coalescing buffer for per-step status updates.

use std::sync::Arc;

use tracing::warn;

use crate::api;
use crate::client::AgentTransport;

#[derive(Default)]
pub struct UpdateBatcher {
    queued: Vec<api::CommandResult>,
    history: Vec<api::CommandResult>,
}

impl UpdateBatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a result. A newer result for the same command replaces the
    /// buffered one, so an `EXECUTING` that was never flushed coalesces
    /// into the terminal status. History keeps every result ever queued.
    pub fn queue(&mut self, result: api::CommandResult) {
        self.history.push(result.clone());
        match self.queued.iter().rposition(|r| r.name == result.name) {
            Some(index) => self.queued[index] = result,
            None => self.queued.push(result),
        }
    }

    /// Ship everything buffered as one update call. Delivery failures are
    /// logged and dropped; the history stays authoritative for the final
    /// report.
    pub async fn flush(
        &mut self,
        transport: &Arc<dyn AgentTransport>,
        task_identification: &api::TaskIdentification,
    ) {
        if self.queued.is_empty() {
            return;
        }

        let request = api::ReportCommandUpdatesRequest {
            task_identification: Some(task_identification.clone()),
            updates: std::mem::take(&mut self.queued),
        };
        if let Err(status) = transport.report_command_updates(request).await {
            warn!(error = %status, "failed to report command updates");
        }
    }

    /// Append-only sequence of every result that has ever been queued.
    pub fn history(&self) -> Vec<api::CommandResult> {
        self.history.clone()
    }
}
