//! The executor engine: drives a task from the initial command fetch to the
//! final report.

pub mod artifacts;
pub mod cache;
pub mod clone;
pub mod metrics;
pub mod terminal;
pub mod update_batcher;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api;
use crate::cirrus_env::CirrusEnv;
use crate::client::AgentTransport;
use crate::environment::Environment;
use crate::logs::LogUploader;
use crate::process;
use crate::retry::{retry_async, RetryConfig, RetryError};
use crate::vault_unboxer::{BoxedValue, VaultUnboxer};

use self::terminal::TerminalWrapper;
use self::update_batcher::UpdateBatcher;

const INITIAL_COMMANDS_RETRY_DELAY: Duration = Duration::from_secs(5);
const FINAL_REPORT_RETRY_DELAY: Duration = Duration::from_secs(10);
const METRICS_RESULT_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_TERMINAL_EXPIRATION: Duration = Duration::from_secs(15 * 60);

pub struct CommandAndLogs {
    pub name: String,
    pub process: process::ShellProcess,
    pub logs: Arc<LogUploader>,
}

#[derive(Debug, Clone, Copy)]
pub struct StepResult {
    pub success: bool,
    pub signaled_to_exit: bool,
    pub duration: Duration,
}

enum StepOutcome {
    Finished(StepResult),
    /// The exit instruction: stop iterating, teardown still runs.
    ExitRequested,
}

pub struct Executor {
    task_identification: api::TaskIdentification,
    server_token: String,
    transport: Arc<dyn AgentTransport>,
    background_commands: Vec<CommandAndLogs>,
    http_cache_host: String,
    command_from: String,
    command_to: String,
    pre_created_working_dir: String,
    cache_attempts: cache::CacheAttempts,
    cache_plans: HashMap<String, cache::CachePlan>,
    env: Environment,
    terminal_wrapper: Option<TerminalWrapper>,
}

impl Executor {
    pub fn new(
        task_id: i64,
        client_token: impl Into<String>,
        server_token: impl Into<String>,
        command_from: impl Into<String>,
        command_to: impl Into<String>,
        pre_created_working_dir: impl Into<String>,
        transport: Arc<dyn AgentTransport>,
    ) -> Self {
        Self {
            task_identification: api::TaskIdentification {
                task_id,
                secret: client_token.into(),
            },
            server_token: server_token.into(),
            transport,
            background_commands: Vec::new(),
            http_cache_host: String::new(),
            command_from: command_from.into(),
            command_to: command_to.into(),
            pre_created_working_dir: pre_created_working_dir.into(),
            cache_attempts: cache::CacheAttempts::new(),
            cache_plans: HashMap::new(),
            env: Environment::new(),
            terminal_wrapper: None,
        }
    }

    pub async fn run_build(&mut self, token: &CancellationToken) {
        let metrics_token = token.child_token();
        let metrics_receiver = metrics::run(metrics_token.clone());

        info!("getting initial commands");
        let response = {
            let config = RetryConfig::fixed(u32::MAX, INITIAL_COMMANDS_RETRY_DELAY);
            let transport = Arc::clone(&self.transport);
            let task_identification = self.task_identification.clone();
            let command_from = self.command_from.clone();
            let outcome = retry_async(&config, token, move |attempt| {
                let transport = Arc::clone(&transport);
                let request = api::InitialCommandsRequest {
                    task_identification: Some(task_identification.clone()),
                    local_timestamp: unix_timestamp(),
                    continue_from_command: command_from.clone(),
                    retry: attempt > 1,
                };
                async move { transport.initial_commands(request).await }
            })
            .await;

            match outcome {
                Ok(response) => response,
                // Cancelled before we had a chance to get initial commands.
                Err(RetryError::Cancelled) => return,
                Err(RetryError::Exhausted(status)) => {
                    error!(error = %status, "failed to get initial commands");
                    return;
                }
            }
        };

        if response.server_token != self.server_token {
            panic!("server token is incorrect!");
        }

        let script_environment = self.script_environment(response.environment.clone());
        self.env.merge(script_environment, false);

        if !self.unbox_environment(token).await {
            return;
        }

        match self.env.lookup("CIRRUS_WORKING_DIR") {
            Some(working_dir) => {
                ensure_folder_exists(Path::new(&working_dir));
                if let Err(e) = std::env::set_current_dir(&working_dir) {
                    warn!(working_dir = %working_dir, error = %e, "failed to change current working directory");
                }
            }
            None => {
                info!("not changing current working directory because CIRRUS_WORKING_DIR is not set");
            }
        }

        let commands = response.commands;

        if let Ok(cache_host) = std::env::var("CIRRUS_HTTP_CACHE_HOST") {
            self.env.set("CIRRUS_HTTP_CACHE_HOST", cache_host);
        }
        if self.env.lookup("CIRRUS_HTTP_CACHE_HOST").is_none() {
            match crate::http_cache::start(self.task_identification.task_id).await {
                Ok(address) => self.env.set("CIRRUS_HTTP_CACHE_HOST", address),
                Err(e) => warn!(error = %e, "failed to start the local HTTP cache host"),
            }
        }
        self.http_cache_host = self.env.get("CIRRUS_HTTP_CACHE_HOST");

        let step_token = token.child_token();
        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(response.timeout_in_seconds.max(0) as u64);

        self.env
            .add_sensitive_values(response.secrets_to_mask.clone());

        if commands.is_empty() {
            return;
        }

        // Launch the terminal session ahead of the loop in case the task
        // waits for remote access.
        let terminal_instruction = commands.iter().find_map(|command| {
            if let Some(api::command::Instruction::WaitForTerminalInstruction(instruction)) =
                &command.instruction
            {
                Some(instruction.clone())
            } else {
                None
            }
        });
        if let Some(instruction) = terminal_instruction {
            let expire_in = self
                .env
                .lookup("CIRRUS_TERMINAL_EXPIRATION_WINDOW")
                .and_then(|value| value.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_TERMINAL_EXPIRATION);
            self.terminal_wrapper = Some(TerminalWrapper::new(
                step_token.clone(),
                instruction.terminal_server_address,
                expire_in,
            ));
        }

        let mut failed_at_least_once = response.failed_at_least_once;
        let mut batcher = UpdateBatcher::new();

        let bounded: Vec<api::Command> =
            bounded_commands(&commands, &self.command_from, &self.command_to).to_vec();

        for command in &bounded {
            let should_run = match command.execution_behaviour() {
                api::ExecutionBehaviour::OnSuccess => !failed_at_least_once,
                api::ExecutionBehaviour::OnFailure => failed_at_least_once,
                api::ExecutionBehaviour::Always => true,
            };
            if !should_run {
                batcher.queue(api::CommandResult {
                    name: command.name.clone(),
                    status: api::Status::Skipped as i32,
                    duration_in_nanos: 0,
                    signaled_to_exit: false,
                });
                continue;
            }

            batcher.queue(api::CommandResult {
                name: command.name.clone(),
                status: api::Status::Executing as i32,
                duration_in_nanos: 0,
                signaled_to_exit: false,
            });
            batcher
                .flush(&self.transport, &self.task_identification)
                .await;

            info!(command = %command.name, "executing");

            let step_result = match self.perform_step(&step_token, deadline, command).await {
                StepOutcome::Finished(step_result) => step_result,
                StepOutcome::ExitRequested => break,
            };

            if !step_result.success {
                failed_at_least_once = true;
            }

            info!(command = %command.name, success = step_result.success, "finished");

            let status = if step_result.success {
                api::Status::Completed
            } else {
                api::Status::Failed
            };
            batcher.queue(api::CommandResult {
                name: command.name.clone(),
                status: status as i32,
                duration_in_nanos: step_result.duration.as_nanos() as i64,
                signaled_to_exit: step_result.signaled_to_exit,
            });
        }

        batcher
            .flush(&self.transport, &self.task_identification)
            .await;

        self.drain_background_commands().await;

        metrics_token.cancel();
        let resource_utilization =
            match tokio::time::timeout(METRICS_RESULT_TIMEOUT, metrics_receiver).await {
                Ok(Ok(result)) => {
                    for message in &result.errors {
                        let message = format!(
                            "Encountered an error while gathering resource utilization metrics: {message}"
                        );
                        warn!("{message}");
                        self.report_warning(&message).await;
                    }
                    result.resource_utilization
                }
                Ok(Err(_)) | Err(_) => {
                    let message = "Failed to retrieve resource utilization metrics in time";
                    warn!("{message}");
                    self.report_warning(message).await;
                    None
                }
            };

        let config = RetryConfig::fixed(2, FINAL_REPORT_RETRY_DELAY);
        let transport = Arc::clone(&self.transport);
        let request = api::ReportAgentFinishedRequest {
            task_identification: Some(self.task_identification.clone()),
            cache_retrieval_attempts: Some(self.cache_attempts.to_proto()),
            resource_utilization,
            command_results: batcher.history(),
        };
        let outcome = retry_async(&config, token, move |_| {
            let transport = Arc::clone(&transport);
            let request = request.clone();
            async move { transport.report_agent_finished(request).await }
        })
        .await;
        if let Err(RetryError::Exhausted(status)) = outcome {
            error!(error = %status, "failed to report that the agent has finished");
        }
    }

    /// Resolve every `VAULT[...]` value in the environment. Any failure is
    /// reported to the controller and terminates the task before the first
    /// step.
    async fn unbox_environment(&mut self, _token: &CancellationToken) -> bool {
        let mut unboxer: Option<VaultUnboxer> = None;

        let snapshot: Vec<(String, String)> = self
            .env
            .items()
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        for (key, value) in snapshot {
            let boxed = match BoxedValue::parse(&value) {
                Ok(None) => continue,
                Ok(Some(boxed)) => boxed,
                Err(e) => {
                    let message = format!("failed to parse a Vault-boxed value {value}: {e}");
                    error!("{message}");
                    self.report_error(&message).await;
                    return false;
                }
            };

            if unboxer.is_none() {
                match VaultUnboxer::from_environment(&self.env).await {
                    Ok(client) => unboxer = Some(client),
                    Err(e) => {
                        let message = format!("failed to initialize a Vault client: {e}");
                        error!("{message}");
                        self.report_error(&message).await;
                        return false;
                    }
                }
            }

            match unboxer
                .as_ref()
                .expect("unboxer was just initialized")
                .unbox(&boxed)
                .await
            {
                Ok(unboxed) => {
                    self.env.set(key, unboxed.clone());
                    self.env.add_sensitive_values(vec![unboxed]);
                }
                Err(e) => {
                    let message = format!("failed to unbox a Vault-boxed value {value}: {e}");
                    error!("{message}");
                    self.report_error(&message).await;
                    return false;
                }
            }
        }

        true
    }

    /// Server-supplied variables plus synthesised defaults for the host
    /// platform and the working directory.
    fn script_environment(&self, mut environment: HashMap<String, String>) -> HashMap<String, String> {
        if !environment.contains_key("OS") && std::env::var("OS").is_err() {
            environment.insert("OS".to_string(), os_name().to_string());
        }
        environment.insert("CIRRUS_OS".to_string(), os_name().to_string());
        environment.insert("CIRRUS_ARCH".to_string(), arch_name().to_string());

        // Use the directory created by a persistent worker unless the task
        // specification overrides it.
        if !environment.contains_key("CIRRUS_WORKING_DIR") && !self.pre_created_working_dir.is_empty()
        {
            environment.insert(
                "CIRRUS_WORKING_DIR".to_string(),
                self.pre_created_working_dir.clone(),
            );
        }

        if !environment.contains_key("CIRRUS_WORKING_DIR") {
            let default_temp_dir = std::env::temp_dir().join("cirrus-ci-build");
            let working_dir = if !default_temp_dir.exists() || !self.command_from.is_empty() {
                // The default folder either is free, or holds the state of
                // the run we are resuming.
                default_temp_dir
            } else {
                std::env::temp_dir().join(format!(
                    "cirrus-task-{}",
                    self.task_identification.task_id
                ))
            };
            environment.insert("CIRRUS_WORKING_DIR".to_string(), to_slash(&working_dir));
        }

        environment
    }

    async fn perform_step(
        &mut self,
        token: &CancellationToken,
        deadline: tokio::time::Instant,
        current_step: &api::Command,
    ) -> StepOutcome {
        let start = std::time::Instant::now();
        let mut success = false;
        let mut signaled_to_exit = false;
        let kill_tree = self.should_kill_processes();

        let uploader = Arc::new(LogUploader::new(
            Arc::clone(&self.transport),
            self.task_identification.clone(),
            current_step.name.clone(),
            self.env.sensitive_values(),
        ));

        let cirrus_env = match CirrusEnv::new(self.task_identification.task_id) {
            Ok(cirrus_env) => cirrus_env,
            Err(e) => {
                let message = format!("Failed to initialize the CIRRUS_ENV subsystem: {e}");
                error!("{message}");
                uploader.write_line(&message);
                uploader.finalize().await;
                return StepOutcome::Finished(StepResult {
                    success: false,
                    signaled_to_exit: false,
                    duration: start.elapsed(),
                });
            }
        };
        self.env
            .set("CIRRUS_ENV", cirrus_env.path().to_string_lossy().into_owned());

        let mut background = false;

        match &current_step.instruction {
            Some(api::command::Instruction::ExitInstruction(_)) => {
                uploader.finalize().await;
                return StepOutcome::ExitRequested;
            }
            Some(api::command::Instruction::CloneInstruction(_)) => {
                success = clone::clone_repository(Arc::clone(&uploader), &self.env).await;
            }
            Some(api::command::Instruction::FileInstruction(instruction)) => {
                success = self.create_file(&uploader, instruction);
            }
            Some(api::command::Instruction::ScriptInstruction(instruction)) => {
                let result = process::run_scripts_and_wait(
                    token,
                    deadline,
                    &current_step.name,
                    &instruction.scripts,
                    &self.env,
                    Arc::clone(&uploader),
                    kill_tree,
                )
                .await;
                match result {
                    Ok(status) => {
                        success = status.success();
                        signaled_to_exit = process::signaled_to_exit(&status);
                    }
                    Err(e) => {
                        // Deadline expiry is not a signal kill.
                        if e.is_timeout() {
                            signaled_to_exit = false;
                        }
                        success = false;
                    }
                }
            }
            Some(api::command::Instruction::BackgroundScriptInstruction(instruction)) => {
                match process::spawn_scripts(&instruction.scripts, &self.env, Arc::clone(&uploader))
                {
                    Ok(shell_process) => {
                        self.background_commands.push(CommandAndLogs {
                            name: current_step.name.clone(),
                            process: shell_process,
                            logs: Arc::clone(&uploader),
                        });
                        info!(
                            index = self.background_commands.len(),
                            command = %current_step.name,
                            "started execution of background command"
                        );
                        background = true;
                        success = true;
                    }
                    Err(e) => {
                        error!(command = %current_step.name, error = %e, "failed to start background command");
                        uploader.write_line(format!("Failed to create command line: {e}"));
                        uploader.finalize().await;
                        success = false;
                    }
                }
            }
            Some(api::command::Instruction::CacheInstruction(instruction)) => {
                let (cache_success, plan) = cache::download_cache(
                    token,
                    deadline,
                    Arc::clone(&uploader),
                    &current_step.name,
                    &self.http_cache_host,
                    instruction,
                    &self.env,
                    &mut self.cache_attempts,
                    kill_tree,
                )
                .await;
                success = cache_success;
                if let Some(plan) = plan {
                    self.cache_plans.insert(current_step.name.clone(), plan);
                }
            }
            Some(api::command::Instruction::UploadCacheInstruction(instruction)) => {
                success = cache::upload_cache(
                    Arc::clone(&uploader),
                    &instruction.cache_name,
                    &self.http_cache_host,
                    self.cache_plans.get(&instruction.cache_name),
                    &self.env,
                    &mut self.cache_attempts,
                )
                .await;
            }
            Some(api::command::Instruction::ArtifactsInstruction(instruction)) => {
                success = artifacts::upload_artifacts(
                    Arc::clone(&uploader),
                    self.task_identification.task_id,
                    &current_step.name,
                    &self.http_cache_host,
                    instruction,
                    &self.env,
                )
                .await;
            }
            Some(api::command::Instruction::WaitForTerminalInstruction(_)) => {
                success = self.wait_for_terminal(&uploader).await;
            }
            None => {
                warn!(command = %current_step.name, "unsupported instruction");
                uploader.write_line("Unsupported instruction!");
                success = false;
            }
        }

        match cirrus_env.consume() {
            Ok(variables) => {
                let mark_sensitive = self.env.lookup("CIRRUS_ENV_SENSITIVE").is_some();
                self.env.merge(variables, mark_sensitive);
            }
            Err(e) => {
                let message = format!("Failed to collect CIRRUS_ENV subsystem results: {e}");
                error!("{message}");
                uploader.write_line(&message);
            }
        }

        // Background uploaders outlive the step; they are finalised when
        // the registry drains at teardown.
        if !background {
            uploader.finalize().await;
        }

        StepOutcome::Finished(StepResult {
            success,
            signaled_to_exit,
            duration: start.elapsed(),
        })
    }

    async fn wait_for_terminal(&self, uploader: &LogUploader) -> bool {
        let Some(wrapper) = &self.terminal_wrapper else {
            uploader.write_line("Terminal wrapper was never started!");
            return false;
        };

        loop {
            match wrapper.next_operation().await {
                Some(terminal::Operation::Log(message)) => {
                    info!("{message}");
                    uploader.write_line(&message);
                }
                Some(terminal::Operation::Exit { success }) => return success,
                None => return false,
            }
        }
    }

    fn create_file(&self, uploader: &LogUploader, instruction: &api::FileInstruction) -> bool {
        match &instruction.source {
            Some(api::file_instruction::Source::FromEnvironmentVariable(env_name)) => {
                let Some(content) = self.env.lookup(env_name) else {
                    uploader.write_line(format!(
                        "Environment variable {env_name} is not set! Skipping file creation..."
                    ));
                    return true;
                };
                if content.starts_with("ENCRYPTED") {
                    uploader.write_line(format!(
                        "Environment variable {env_name} wasn't decrypted! Skipping file creation..."
                    ));
                    return true;
                }

                let file_path = PathBuf::from(self.env.expand_text(&instruction.destination_path));
                if let Some(parent) = file_path.parent() {
                    ensure_folder_exists(parent);
                }
                if let Err(e) = std::fs::write(&file_path, content.as_bytes()) {
                    uploader.write_line(format!(
                        "Failed to write file {}: {e}!",
                        file_path.display()
                    ));
                    return false;
                }
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let _ = std::fs::set_permissions(
                        &file_path,
                        std::fs::Permissions::from_mode(0o644),
                    );
                }
                uploader.write_line(format!("Created file {}!", file_path.display()));
                true
            }
            None => {
                warn!("unsupported file instruction source");
                false
            }
        }
    }

    fn should_kill_processes(&self) -> bool {
        // Tasks may opt into letting descendant processes survive a kill.
        self.env.lookup("CIRRUS_ESCAPING_PROCESSES").is_none()
    }

    /// Kill and finalise every background script. Draining twice is safe:
    /// the registry empties on the first call.
    pub async fn drain_background_commands(&mut self) {
        let entries = std::mem::take(&mut self.background_commands);
        info!("background commands to clean up after: {}", entries.len());

        for mut entry in entries {
            info!(command = %entry.name, "cleaning up after background command");
            if let Err(message) = entry.process.terminate(false) {
                entry.logs.write_line(format!(
                    "\nFailed to stop background script {}: {message}!",
                    entry.name
                ));
            }
            let _ = tokio::time::timeout(Duration::from_secs(1), entry.process.wait()).await;
            entry.process.drain_output().await;
            entry.logs.finalize().await;
        }
    }

    async fn report_error(&self, message: &str) {
        let request = api::ReportAgentProblemRequest {
            task_identification: Some(self.task_identification.clone()),
            message: message.to_string(),
            stack: String::new(),
        };
        let _ = self.transport.report_agent_error(request).await;
    }

    async fn report_warning(&self, message: &str) {
        let request = api::ReportAgentProblemRequest {
            task_identification: Some(self.task_identification.clone()),
            message: message.to_string(),
            stack: String::new(),
        };
        let _ = self.transport.report_agent_warning(request).await;
    }
}

/// Bound a slice of commands with unique names to a half-open range
/// `[from_name, to_name)`. An absent name leaves its side unbounded.
pub fn bounded_commands<'a>(
    commands: &'a [api::Command],
    from_name: &str,
    to_name: &str,
) -> &'a [api::Command] {
    let mut left = 0;
    let mut right = commands.len();

    for (index, command) in commands.iter().enumerate() {
        if !from_name.is_empty() && command.name == from_name {
            left = index;
        }
        if !to_name.is_empty() && command.name == to_name {
            right = index;
        }
    }

    &commands[left..right]
}

fn ensure_folder_exists(path: &Path) {
    if let Err(e) = std::fs::create_dir_all(path) {
        warn!(path = %path.display(), error = %e, "failed to create directory");
    }
}

fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default()
}

/// Platform vocabulary the controller expects.
fn os_name() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    }
}

fn arch_name() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "x86" => "386",
        "aarch64" => "arm64",
        other => other,
    }
}

fn to_slash(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
