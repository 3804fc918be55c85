use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::api;
use crate::testing::{script_command, FakeTransport};

use super::*;

fn commands_response(
    commands: Vec<api::Command>,
    environment: Vec<(&str, &str)>,
) -> api::CommandsResponse {
    let mut env: std::collections::HashMap<String, String> = environment
        .into_iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    // Keep the run hermetic: no local cache host gets started.
    env.entry("CIRRUS_HTTP_CACHE_HOST".to_string())
        .or_insert_with(|| "127.0.0.1:1".to_string());

    api::CommandsResponse {
        environment: env,
        commands,
        server_token: "server-token".to_string(),
        timeout_in_seconds: 600,
        secrets_to_mask: Vec::new(),
        failed_at_least_once: false,
    }
}

fn test_executor(transport: Arc<FakeTransport>) -> Executor {
    Executor::new(
        42,
        "client-secret",
        "server-token",
        "",
        "",
        "",
        transport,
    )
}

fn statuses(results: &[api::CommandResult]) -> Vec<(String, api::Status)> {
    results
        .iter()
        .map(|result| (result.name.clone(), result.status()))
        .collect()
}

#[tokio::test]
async fn happy_path_reports_results_in_order() {
    let workdir = tempfile::TempDir::new().unwrap();
    let transport = FakeTransport::with_response(commands_response(
        vec![
            script_command("main", "echo hi", api::ExecutionBehaviour::Always),
            script_command("after", "true", api::ExecutionBehaviour::OnSuccess),
        ],
        vec![("CIRRUS_WORKING_DIR", workdir.path().to_str().unwrap())],
    ));

    let mut executor = test_executor(Arc::clone(&transport));
    executor.run_build(&CancellationToken::new()).await;

    let transmitted = transport.transmitted_results();
    assert_eq!(
        statuses(&transmitted),
        vec![
            ("main".to_string(), api::Status::Executing),
            ("main".to_string(), api::Status::Completed),
            ("after".to_string(), api::Status::Executing),
            ("after".to_string(), api::Status::Completed),
        ]
    );

    let finished = transport.finished.lock();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].command_results.len(), 4);
}

#[tokio::test]
async fn failure_fans_out_skips_and_activates_on_failure() {
    let workdir = tempfile::TempDir::new().unwrap();
    let transport = FakeTransport::with_response(commands_response(
        vec![
            script_command("a", "false", api::ExecutionBehaviour::Always),
            script_command("b", "true", api::ExecutionBehaviour::OnSuccess),
            script_command("c", "true", api::ExecutionBehaviour::OnFailure),
        ],
        vec![("CIRRUS_WORKING_DIR", workdir.path().to_str().unwrap())],
    ));

    let mut executor = test_executor(Arc::clone(&transport));
    executor.run_build(&CancellationToken::new()).await;

    assert_eq!(
        statuses(&transport.transmitted_results()),
        vec![
            ("a".to_string(), api::Status::Executing),
            ("a".to_string(), api::Status::Failed),
            ("b".to_string(), api::Status::Skipped),
            ("c".to_string(), api::Status::Executing),
            ("c".to_string(), api::Status::Completed),
        ]
    );
}

#[tokio::test]
async fn resumption_bounds_the_evaluated_range() {
    let workdir = tempfile::TempDir::new().unwrap();
    let transport = FakeTransport::with_response(commands_response(
        vec![
            script_command("a", "true", api::ExecutionBehaviour::Always),
            script_command("b", "true", api::ExecutionBehaviour::Always),
            script_command("c", "true", api::ExecutionBehaviour::Always),
            script_command("d", "true", api::ExecutionBehaviour::Always),
        ],
        vec![("CIRRUS_WORKING_DIR", workdir.path().to_str().unwrap())],
    ));

    let mut executor = Executor::new(
        42,
        "client-secret",
        "server-token",
        "b",
        "d",
        "",
        Arc::clone(&transport) as Arc<dyn AgentTransport>,
    );
    executor.run_build(&CancellationToken::new()).await;

    let history = {
        let finished = transport.finished.lock();
        finished[0].command_results.clone()
    };
    assert!(history.iter().all(|result| result.name != "a"));
    assert!(history.iter().all(|result| result.name != "d"));
    assert_eq!(
        statuses(&history),
        vec![
            ("b".to_string(), api::Status::Executing),
            ("b".to_string(), api::Status::Completed),
            ("c".to_string(), api::Status::Executing),
            ("c".to_string(), api::Status::Completed),
        ]
    );

    // The resumption flag also reaches the initial request.
    let initial = transport.initial_requests.lock();
    assert_eq!(initial[0].continue_from_command, "b");
}

#[tokio::test]
async fn server_token_mismatch_executes_nothing() {
    let workdir = tempfile::TempDir::new().unwrap();
    let mut response = commands_response(
        vec![script_command(
            "main",
            "echo hi",
            api::ExecutionBehaviour::Always,
        )],
        vec![("CIRRUS_WORKING_DIR", workdir.path().to_str().unwrap())],
    );
    response.server_token = "X".to_string();

    let transport = FakeTransport::with_response(response);
    let mut executor = Executor::new(
        42,
        "client-secret",
        "Y",
        "",
        "",
        "",
        Arc::clone(&transport) as Arc<dyn AgentTransport>,
    );

    let outcome = tokio::spawn(async move {
        executor.run_build(&CancellationToken::new()).await;
    })
    .await;

    assert!(outcome.unwrap_err().is_panic());
    assert!(transport.update_batches.lock().is_empty());
    assert!(transport.finished.lock().is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn unboxed_secrets_reach_scripts_and_stay_masked() {
    use axum::routing::get;
    use axum::Router;

    // A one-route credential store: GET /v1/kv/data/my
    let app = Router::new().route(
        "/v1/kv/data/my",
        get(|| async {
            axum::Json(serde_json::json!({ "data": { "field": "s3cr3t" } }))
        }),
    );
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let vault_url = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let workdir = tempfile::TempDir::new().unwrap();
    let transport = FakeTransport::with_response(commands_response(
        vec![script_command(
            "main",
            "echo Running $KEY",
            api::ExecutionBehaviour::Always,
        )],
        vec![
            ("CIRRUS_WORKING_DIR", workdir.path().to_str().unwrap()),
            ("KEY", "VAULT[kv/data/my#field]"),
            ("CIRRUS_VAULT_URL", vault_url.as_str()),
        ],
    ));

    let mut executor = test_executor(Arc::clone(&transport));
    executor.run_build(&CancellationToken::new()).await;

    assert_eq!(executor.env.get("KEY"), "s3cr3t");

    let log = transport.log_text("main");
    assert!(log.contains("Running ***"), "log was: {log}");
    assert!(!log.contains("s3cr3t"));
}

#[tokio::test]
async fn malformed_boxed_value_aborts_before_any_step() {
    let workdir = tempfile::TempDir::new().unwrap();
    let transport = FakeTransport::with_response(commands_response(
        vec![script_command(
            "main",
            "echo hi",
            api::ExecutionBehaviour::Always,
        )],
        vec![
            ("CIRRUS_WORKING_DIR", workdir.path().to_str().unwrap()),
            ("KEY", "VAULT[broken"),
        ],
    ));

    let mut executor = test_executor(Arc::clone(&transport));
    executor.run_build(&CancellationToken::new()).await;

    assert!(transport.update_batches.lock().is_empty());
    assert_eq!(transport.errors.lock().len(), 1);
}

#[cfg(unix)]
#[tokio::test]
async fn background_scripts_are_killed_and_finalised_at_teardown() {
    let workdir = tempfile::TempDir::new().unwrap();
    let transport = FakeTransport::with_response(commands_response(
        vec![
            api::Command {
                name: "bg".to_string(),
                execution_behaviour: api::ExecutionBehaviour::Always as i32,
                instruction: Some(api::command::Instruction::BackgroundScriptInstruction(
                    api::BackgroundScriptInstruction {
                        scripts: vec!["sleep 300".to_string()],
                    },
                )),
            },
            script_command("main", "true", api::ExecutionBehaviour::Always),
        ],
        vec![("CIRRUS_WORKING_DIR", workdir.path().to_str().unwrap())],
    ));

    let mut executor = test_executor(Arc::clone(&transport));
    let teardown_started = std::time::Instant::now();
    executor.run_build(&CancellationToken::new()).await;

    // The 300 second sleeper must not hold the build open.
    assert!(teardown_started.elapsed() < std::time::Duration::from_secs(30));
    assert!(executor.background_commands.is_empty());

    let statuses = statuses(&transport.transmitted_results());
    assert!(statuses.contains(&("bg".to_string(), api::Status::Completed)));
}

#[cfg(unix)]
#[tokio::test]
async fn draining_the_background_registry_twice_is_safe() {
    let transport = FakeTransport::new();
    let mut executor = test_executor(Arc::clone(&transport));

    let uploader = crate::testing::uploader(Arc::clone(&transport), "bg");
    let shell_process = crate::process::spawn_scripts(
        &["sleep 300".to_string()],
        &executor.env,
        Arc::clone(&uploader),
    )
    .unwrap();
    executor.background_commands.push(CommandAndLogs {
        name: "bg".to_string(),
        process: shell_process,
        logs: uploader,
    });

    executor.drain_background_commands().await;
    let chunks_after_first = transport.log_chunks.lock().len();
    executor.drain_background_commands().await;

    assert!(executor.background_commands.is_empty());
    // The second drain must not double-finalise the log sink.
    assert_eq!(transport.log_chunks.lock().len(), chunks_after_first);
}

#[tokio::test]
async fn exit_instruction_stops_the_loop_but_still_reports() {
    let workdir = tempfile::TempDir::new().unwrap();
    let transport = FakeTransport::with_response(commands_response(
        vec![
            script_command("first", "true", api::ExecutionBehaviour::Always),
            api::Command {
                name: "stop".to_string(),
                execution_behaviour: api::ExecutionBehaviour::Always as i32,
                instruction: Some(api::command::Instruction::ExitInstruction(
                    api::ExitInstruction {},
                )),
            },
            script_command("never", "true", api::ExecutionBehaviour::Always),
        ],
        vec![("CIRRUS_WORKING_DIR", workdir.path().to_str().unwrap())],
    ));

    let mut executor = test_executor(Arc::clone(&transport));
    executor.run_build(&CancellationToken::new()).await;

    let history = {
        let finished = transport.finished.lock();
        finished[0].command_results.clone()
    };
    assert!(history.iter().all(|result| result.name != "never"));
    assert!(history.iter().any(|result| result.name == "first"));
}

#[tokio::test]
async fn secrets_to_mask_are_redacted_from_logs() {
    let workdir = tempfile::TempDir::new().unwrap();
    let mut response = commands_response(
        vec![script_command(
            "main",
            "echo the password is hunter2",
            api::ExecutionBehaviour::Always,
        )],
        vec![("CIRRUS_WORKING_DIR", workdir.path().to_str().unwrap())],
    );
    response.secrets_to_mask = vec!["hunter2".to_string()];

    let transport = FakeTransport::with_response(response);
    let mut executor = test_executor(Arc::clone(&transport));
    executor.run_build(&CancellationToken::new()).await;

    let log = transport.log_text("main");
    assert!(!log.contains("hunter2"));
    assert!(log.contains("***"));
}

#[tokio::test]
async fn cancelled_parent_returns_silently_before_initial_commands() {
    let transport = FakeTransport::new();
    let token = CancellationToken::new();
    token.cancel();

    let mut executor = test_executor(Arc::clone(&transport));
    executor.run_build(&token).await;

    assert!(transport.finished.lock().is_empty());
}

#[test]
fn bounded_commands_with_empty_bounds_is_identity() {
    let commands = vec![
        script_command("a", "true", api::ExecutionBehaviour::Always),
        script_command("b", "true", api::ExecutionBehaviour::Always),
    ];
    assert_eq!(bounded_commands(&commands, "", "").len(), 2);
}

#[test]
fn bounded_commands_is_a_half_open_range() {
    let commands = vec![
        script_command("a", "true", api::ExecutionBehaviour::Always),
        script_command("b", "true", api::ExecutionBehaviour::Always),
        script_command("c", "true", api::ExecutionBehaviour::Always),
        script_command("d", "true", api::ExecutionBehaviour::Always),
    ];

    let bounded = bounded_commands(&commands, "b", "d");
    let names: Vec<&str> = bounded.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["b", "c"]);
}

#[test]
fn bounded_commands_defaults_missing_names() {
    let commands = vec![
        script_command("a", "true", api::ExecutionBehaviour::Always),
        script_command("b", "true", api::ExecutionBehaviour::Always),
    ];

    assert_eq!(bounded_commands(&commands, "nope", "").len(), 2);
    assert_eq!(bounded_commands(&commands, "", "nope").len(), 2);
    assert_eq!(bounded_commands(&commands, "b", "").len(), 1);
}

#[test]
fn script_environment_synthesises_platform_defaults() {
    let transport = FakeTransport::new();
    let executor = test_executor(transport);

    let environment = executor.script_environment(std::collections::HashMap::new());
    assert_eq!(environment["CIRRUS_OS"], os_name());
    assert_eq!(environment["CIRRUS_ARCH"], arch_name());
    assert!(environment.contains_key("CIRRUS_WORKING_DIR"));
    assert!(!environment["CIRRUS_WORKING_DIR"].contains('\\'));
}

#[test]
fn script_environment_prefers_the_pre_created_working_dir() {
    let transport = FakeTransport::new();
    let executor = Executor::new(
        42,
        "client-secret",
        "server-token",
        "",
        "",
        "/persistent/worker/dir",
        transport,
    );

    let environment = executor.script_environment(std::collections::HashMap::new());
    assert_eq!(environment["CIRRUS_WORKING_DIR"], "/persistent/worker/dir");

    // A server-supplied value wins over the pre-created directory.
    let mut server = std::collections::HashMap::new();
    server.insert("CIRRUS_WORKING_DIR".to_string(), "/from/server".to_string());
    let environment = executor.script_environment(server);
    assert_eq!(environment["CIRRUS_WORKING_DIR"], "/from/server");
}

#[test]
fn file_instruction_skips_encrypted_and_missing_variables() {
    let transport = FakeTransport::new();
    let mut executor = test_executor(Arc::clone(&transport));
    executor.env.set("ENCRYPTED_VAR", "ENCRYPTED[abc]");

    let uploader = crate::testing::uploader(Arc::clone(&transport), "file");

    let missing = api::FileInstruction {
        destination_path: "/tmp/never-written".to_string(),
        source: Some(api::file_instruction::Source::FromEnvironmentVariable(
            "NO_SUCH_VAR".to_string(),
        )),
    };
    assert!(executor.create_file(&uploader, &missing));

    let encrypted = api::FileInstruction {
        destination_path: "/tmp/never-written".to_string(),
        source: Some(api::file_instruction::Source::FromEnvironmentVariable(
            "ENCRYPTED_VAR".to_string(),
        )),
    };
    assert!(executor.create_file(&uploader, &encrypted));
    assert!(!std::path::Path::new("/tmp/never-written").exists());
}

#[test]
fn file_instruction_writes_expanded_destination() {
    let workdir = tempfile::TempDir::new().unwrap();
    let transport = FakeTransport::new();
    let mut executor = test_executor(Arc::clone(&transport));
    executor
        .env
        .set("CIRRUS_WORKING_DIR", workdir.path().to_string_lossy());
    executor.env.set("CONFIG", "key: value");

    let uploader = crate::testing::uploader(transport, "file");
    let instruction = api::FileInstruction {
        destination_path: "${CIRRUS_WORKING_DIR}/conf/settings.yml".to_string(),
        source: Some(api::file_instruction::Source::FromEnvironmentVariable(
            "CONFIG".to_string(),
        )),
    };

    assert!(executor.create_file(&uploader, &instruction));
    let written = std::fs::read_to_string(workdir.path().join("conf/settings.yml")).unwrap();
    assert_eq!(written, "key: value");
}
