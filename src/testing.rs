//! In-memory controller transport for tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use parking_lot::Mutex;
use tonic::Status;

use crate::api;
use crate::client::AgentTransport;
use crate::logs::LogUploader;

/// Records every call the agent makes; `initial_commands` answers with a
/// canned response.
#[derive(Default)]
pub struct FakeTransport {
    pub commands_response: Mutex<Option<api::CommandsResponse>>,
    pub initial_requests: Mutex<Vec<api::InitialCommandsRequest>>,
    pub update_batches: Mutex<Vec<Vec<api::CommandResult>>>,
    pub log_chunks: Mutex<Vec<api::ReportCommandLogsRequest>>,
    pub finished: Mutex<Vec<api::ReportAgentFinishedRequest>>,
    pub errors: Mutex<Vec<String>>,
    pub warnings: Mutex<Vec<String>>,
    pub signals: Mutex<Vec<String>>,
    pub agent_logs: Mutex<Vec<String>>,
    pub stop_hooks: AtomicUsize,
    pub heartbeats: AtomicUsize,
    pub connection_resets: AtomicUsize,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_response(response: api::CommandsResponse) -> Arc<Self> {
        let transport = Self::new();
        *transport.commands_response.lock() = Some(response);
        transport
    }

    /// All transmitted command results, flattened in transmission order.
    pub fn transmitted_results(&self) -> Vec<api::CommandResult> {
        self.update_batches.lock().iter().flatten().cloned().collect()
    }

    /// Everything uploaded for the named command, as text.
    pub fn log_text(&self, command_name: &str) -> String {
        self.log_chunks
            .lock()
            .iter()
            .filter(|chunk| chunk.command_name == command_name)
            .map(|chunk| String::from_utf8_lossy(&chunk.data).into_owned())
            .collect()
    }
}

#[async_trait]
impl AgentTransport for FakeTransport {
    async fn initial_commands(
        &self,
        request: api::InitialCommandsRequest,
    ) -> std::result::Result<api::CommandsResponse, Status> {
        self.initial_requests.lock().push(request);
        self.commands_response
            .lock()
            .clone()
            .ok_or_else(|| Status::unavailable("no canned response configured"))
    }

    async fn report_command_updates(
        &self,
        request: api::ReportCommandUpdatesRequest,
    ) -> std::result::Result<(), Status> {
        self.update_batches.lock().push(request.updates);
        Ok(())
    }

    async fn report_command_logs(
        &self,
        request: api::ReportCommandLogsRequest,
    ) -> std::result::Result<(), Status> {
        self.log_chunks.lock().push(request);
        Ok(())
    }

    async fn report_agent_finished(
        &self,
        request: api::ReportAgentFinishedRequest,
    ) -> std::result::Result<(), Status> {
        self.finished.lock().push(request);
        Ok(())
    }

    async fn report_agent_error(
        &self,
        request: api::ReportAgentProblemRequest,
    ) -> std::result::Result<(), Status> {
        self.errors.lock().push(request.message);
        Ok(())
    }

    async fn report_agent_warning(
        &self,
        request: api::ReportAgentProblemRequest,
    ) -> std::result::Result<(), Status> {
        self.warnings.lock().push(request.message);
        Ok(())
    }

    async fn report_agent_signal(
        &self,
        request: api::ReportAgentSignalRequest,
    ) -> std::result::Result<(), Status> {
        self.signals.lock().push(request.signal);
        Ok(())
    }

    async fn report_agent_logs(
        &self,
        request: api::ReportAgentLogsRequest,
    ) -> std::result::Result<(), Status> {
        self.agent_logs.lock().push(request.logs);
        Ok(())
    }

    async fn report_stop_hook(
        &self,
        _request: api::ReportStopHookRequest,
    ) -> std::result::Result<(), Status> {
        self.stop_hooks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn heartbeat(&self, _request: api::HeartbeatRequest) -> std::result::Result<(), Status> {
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn reset_connection(&self) {
        self.connection_resets.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn task_identification() -> api::TaskIdentification {
    api::TaskIdentification {
        task_id: 42,
        secret: "client-secret".to_string(),
    }
}

pub fn uploader(transport: Arc<FakeTransport>, command_name: &str) -> Arc<LogUploader> {
    Arc::new(LogUploader::new(
        transport,
        task_identification(),
        command_name,
        Arc::new(RwLock::new(HashSet::new())),
    ))
}

pub fn script_command(name: &str, script: &str, behaviour: api::ExecutionBehaviour) -> api::Command {
    api::Command {
        name: name.to_string(),
        execution_behaviour: behaviour as i32,
        instruction: Some(api::command::Instruction::ScriptInstruction(
            api::ScriptInstruction {
                scripts: vec![script.to_string()],
            },
        )),
    }
}
