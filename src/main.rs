use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cirrus_agent::api;
use cirrus_agent::client::{AgentTransport, GrpcTransport};
use cirrus_agent::errors::{Error, Result};
use cirrus_agent::executor::Executor;
use cirrus_agent::{heartbeat, network};

#[derive(Parser)]
#[command(name = "cirrus-agent")]
#[command(about = "Task-side execution agent for a CI controller", long_about = None)]
struct Args {
    /// RPC endpoint of the controller
    #[arg(long, default_value = "https://grpc.cirrus-ci.com:443")]
    api_endpoint: String,

    /// Task ID
    #[arg(long)]
    task_id: i64,

    /// Secret token authenticating this agent towards the controller
    #[arg(long)]
    client_token: String,

    /// Secret token authenticating the controller towards this agent
    #[arg(long)]
    server_token: String,

    /// Report a stop hook and exit instead of running the task
    #[arg(long)]
    stop_hook: bool,

    /// Command to start execution from (inclusive)
    #[arg(long, default_value = "")]
    command_from: String,

    /// Command to stop execution at (exclusive)
    #[arg(long, default_value = "")]
    command_to: String,

    /// Working directory prepared by a persistent worker
    #[arg(long, default_value = "")]
    pre_created_working_dir: String,
}

/// Message and stack of the most recent panic, captured by the hook for
/// the top-level reporter.
static LAST_PANIC: Mutex<Option<(String, String)>> = Mutex::new(None);

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let message = if let Some(message) = info.payload().downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = info.payload().downcast_ref::<String>() {
            message.clone()
        } else {
            "unknown panic".to_string()
        };
        let stack = std::backtrace::Backtrace::force_capture().to_string();
        *LAST_PANIC.lock() = Some((message, stack));
        default_hook(info);
    }));
}

/// Everything the agent logs goes to stderr and to an on-disk file that is
/// uploaded to the controller at the end of the run.
#[derive(Clone)]
struct TeeWriter {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let _ = std::io::stderr().write_all(buf);
        if let Some(file) = &self.file {
            let _ = file.lock().write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let _ = std::io::stderr().flush();
        if let Some(file) = &self.file {
            let _ = file.lock().flush();
        }
        Ok(())
    }
}

fn open_log_file(path: &PathBuf) -> Result<std::fs::File> {
    let mut options = std::fs::OpenOptions::new();
    options.create(true).write(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o660);
    }
    options
        .open(path)
        .map_err(|e| Error::file_system(path.clone(), "open log file", e))
}

#[cfg(unix)]
fn spawn_signal_reporter(
    transport: Arc<dyn AgentTransport>,
    task_identification: api::TaskIdentification,
) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let mut interrupt = match signal(SignalKind::interrupt()) {
            Ok(stream) => stream,
            Err(_) => return,
        };
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(_) => return,
        };
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(stream) => stream,
            Err(_) => return,
        };
        let mut quit = match signal(SignalKind::quit()) {
            Ok(stream) => stream,
            Err(_) => return,
        };

        loop {
            let name = tokio::select! {
                _ = interrupt.recv() => "SIGINT",
                _ = terminate.recv() => "SIGTERM",
                _ = hangup.recv() => "SIGHUP",
                _ = quit.recv() => "SIGQUIT",
            };
            warn!(signal = name, "captured signal");
            let request = api::ReportAgentSignalRequest {
                task_identification: Some(task_identification.clone()),
                signal: name.to_string(),
            };
            let _ = transport.report_agent_signal(request).await;
        }
    });
}

#[cfg(not(unix))]
fn spawn_signal_reporter(
    _transport: Arc<dyn AgentTransport>,
    _task_identification: api::TaskIdentification,
) {
}

async fn wait_for_requested_ports() {
    let Ok(ports_to_wait) = std::env::var("CIRRUS_PORTS_WAIT_FOR") else {
        return;
    };
    for port in ports_to_wait.split(',') {
        let Ok(port) = port.trim().parse::<u16>() else {
            continue;
        };
        info!(port, "waiting on port");
        network::wait_for_local_port(port, Duration::from_secs(60)).await;
    }
}

async fn upload_agent_logs(
    transport: &Arc<dyn AgentTransport>,
    log_file_path: &PathBuf,
    task_identification: &api::TaskIdentification,
) {
    let Ok(logs) = std::fs::read_to_string(log_file_path) else {
        return;
    };
    let request = api::ReportAgentLogsRequest {
        task_identification: Some(task_identification.clone()),
        logs,
    };
    if transport.report_agent_logs(request).await.is_ok() {
        let _ = std::fs::remove_file(log_file_path);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_file_name = if args.stop_hook {
        // A failed run leaves its log file behind for debugging; the stop
        // hook invocation must not overwrite it.
        format!("cirrus-agent-{}-hook.log", args.task_id)
    } else {
        format!("cirrus-agent-{}.log", args.task_id)
    };
    let log_file_path = std::env::temp_dir().join(log_file_name);
    let log_file = open_log_file(&log_file_path)?;

    let writer = TeeWriter {
        file: Some(Arc::new(Mutex::new(log_file))),
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .init();

    install_panic_hook();

    let task_identification = api::TaskIdentification {
        task_id: args.task_id,
        secret: args.client_token.clone(),
    };

    let transport: Arc<dyn AgentTransport> = loop {
        match GrpcTransport::dial(&args.api_endpoint).await {
            Ok(transport) => {
                info!("connected");
                break Arc::new(transport);
            }
            Err(e) => {
                warn!(error = %e, "failed to open a connection");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    };

    if args.stop_hook {
        info!("stop hook");
        let request = api::ReportStopHookRequest {
            task_identification: Some(task_identification.clone()),
        };
        match transport.report_stop_hook(request).await {
            Ok(()) => {
                let _ = std::fs::remove_file(&log_file_path);
            }
            Err(status) => {
                error!(task_id = args.task_id, error = %status, "failed to report stop hook");
            }
        }
        return Ok(());
    }

    spawn_signal_reporter(Arc::clone(&transport), task_identification.clone());

    wait_for_requested_ports().await;

    tokio::spawn(heartbeat::run(
        Arc::clone(&transport),
        task_identification.clone(),
    ));

    let token = CancellationToken::new();
    let mut executor = Executor::new(
        args.task_id,
        args.client_token.clone(),
        args.server_token.clone(),
        args.command_from.clone(),
        args.command_to.clone(),
        args.pre_created_working_dir.clone(),
        Arc::clone(&transport),
    );

    let run_token = token.clone();
    let build = tokio::spawn(async move {
        executor.run_build(&run_token).await;
    });

    if let Err(join_error) = build.await {
        if join_error.is_panic() {
            let (message, stack) = LAST_PANIC
                .lock()
                .take()
                .unwrap_or_else(|| ("unknown panic".to_string(), String::new()));
            error!("recovered from a panic: {message}");
            let request = api::ReportAgentProblemRequest {
                task_identification: Some(task_identification.clone()),
                message,
                stack,
            };
            let _ = transport.report_agent_error(request).await;
        }
    }

    upload_agent_logs(&transport, &log_file_path, &task_identification).await;

    Ok(())
}
