//! Wire types for the controller RPC service.
//!
//! These are hand-rolled `prost` message definitions matching the
//! controller's protobuf contract, so no protoc invocation is needed at
//! build time.

use std::collections::HashMap;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TaskIdentification {
    #[prost(int64, tag = "1")]
    pub task_id: i64,
    #[prost(string, tag = "2")]
    pub secret: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ExecutionBehaviour {
    OnSuccess = 0,
    OnFailure = 1,
    Always = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Status {
    Created = 0,
    Executing = 1,
    Completed = 2,
    Failed = 3,
    Skipped = 4,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExitInstruction {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CloneInstruction {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FileInstruction {
    #[prost(string, tag = "1")]
    pub destination_path: String,
    #[prost(oneof = "file_instruction::Source", tags = "2")]
    pub source: Option<file_instruction::Source>,
}

pub mod file_instruction {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Source {
        #[prost(string, tag = "2")]
        FromEnvironmentVariable(String),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ScriptInstruction {
    #[prost(string, repeated, tag = "1")]
    pub scripts: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BackgroundScriptInstruction {
    #[prost(string, repeated, tag = "1")]
    pub scripts: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CacheInstruction {
    #[prost(string, repeated, tag = "1")]
    pub folders: Vec<String>,
    #[prost(string, repeated, tag = "2")]
    pub fingerprint_scripts: Vec<String>,
    #[prost(string, repeated, tag = "3")]
    pub populate_scripts: Vec<String>,
    #[prost(bool, tag = "4")]
    pub reupload_on_changes: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UploadCacheInstruction {
    /// Name of the command with the `CacheInstruction` this upload refers to.
    #[prost(string, tag = "1")]
    pub cache_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ArtifactsInstruction {
    #[prost(string, repeated, tag = "1")]
    pub paths: Vec<String>,
    #[prost(string, tag = "2")]
    pub r#type: String,
    #[prost(string, tag = "3")]
    pub format: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WaitForTerminalInstruction {
    #[prost(string, tag = "1")]
    pub terminal_server_address: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Command {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(enumeration = "ExecutionBehaviour", tag = "2")]
    pub execution_behaviour: i32,
    #[prost(
        oneof = "command::Instruction",
        tags = "3, 4, 5, 6, 7, 8, 9, 10, 11"
    )]
    pub instruction: Option<command::Instruction>,
}

pub mod command {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Instruction {
        #[prost(message, tag = "3")]
        ExitInstruction(super::ExitInstruction),
        #[prost(message, tag = "4")]
        CloneInstruction(super::CloneInstruction),
        #[prost(message, tag = "5")]
        FileInstruction(super::FileInstruction),
        #[prost(message, tag = "6")]
        ScriptInstruction(super::ScriptInstruction),
        #[prost(message, tag = "7")]
        BackgroundScriptInstruction(super::BackgroundScriptInstruction),
        #[prost(message, tag = "8")]
        CacheInstruction(super::CacheInstruction),
        #[prost(message, tag = "9")]
        UploadCacheInstruction(super::UploadCacheInstruction),
        #[prost(message, tag = "10")]
        ArtifactsInstruction(super::ArtifactsInstruction),
        #[prost(message, tag = "11")]
        WaitForTerminalInstruction(super::WaitForTerminalInstruction),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommandResult {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(enumeration = "Status", tag = "2")]
    pub status: i32,
    #[prost(int64, tag = "3")]
    pub duration_in_nanos: i64,
    #[prost(bool, tag = "4")]
    pub signaled_to_exit: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InitialCommandsRequest {
    #[prost(message, optional, tag = "1")]
    pub task_identification: Option<TaskIdentification>,
    #[prost(int64, tag = "2")]
    pub local_timestamp: i64,
    #[prost(string, tag = "3")]
    pub continue_from_command: String,
    #[prost(bool, tag = "4")]
    pub retry: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommandsResponse {
    #[prost(map = "string, string", tag = "1")]
    pub environment: HashMap<String, String>,
    #[prost(message, repeated, tag = "2")]
    pub commands: Vec<Command>,
    #[prost(string, tag = "3")]
    pub server_token: String,
    #[prost(int64, tag = "4")]
    pub timeout_in_seconds: i64,
    #[prost(string, repeated, tag = "5")]
    pub secrets_to_mask: Vec<String>,
    #[prost(bool, tag = "6")]
    pub failed_at_least_once: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReportCommandUpdatesRequest {
    #[prost(message, optional, tag = "1")]
    pub task_identification: Option<TaskIdentification>,
    #[prost(message, repeated, tag = "2")]
    pub updates: Vec<CommandResult>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReportCommandUpdatesResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReportCommandLogsRequest {
    #[prost(message, optional, tag = "1")]
    pub task_identification: Option<TaskIdentification>,
    #[prost(string, tag = "2")]
    pub command_name: String,
    #[prost(bytes = "vec", tag = "3")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReportCommandLogsResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CacheRetrievalAttempt {
    #[prost(string, tag = "1")]
    pub error: String,
    #[prost(oneof = "cache_retrieval_attempt::Result", tags = "2, 3")]
    pub result: Option<cache_retrieval_attempt::Result>,
}

pub mod cache_retrieval_attempt {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Hit {
        #[prost(uint64, tag = "1")]
        pub size_bytes: u64,
        #[prost(uint64, tag = "2")]
        pub downloaded_in_seconds: u64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Miss {
        #[prost(uint64, tag = "1")]
        pub size_bytes: u64,
        #[prost(uint64, tag = "2")]
        pub populated_in_seconds: u64,
        #[prost(uint64, tag = "3")]
        pub archived_in_seconds: u64,
        #[prost(uint64, tag = "4")]
        pub uploaded_in_seconds: u64,
    }

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(message, tag = "2")]
        Hit(Hit),
        #[prost(message, tag = "3")]
        Miss(Miss),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CacheRetrievalAttempts {
    #[prost(map = "string, message", tag = "1")]
    pub attempts: HashMap<String, CacheRetrievalAttempt>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChartPoint {
    #[prost(uint32, tag = "1")]
    pub seconds_from_start: u32,
    #[prost(double, tag = "2")]
    pub value: f64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResourceUtilization {
    #[prost(message, repeated, tag = "1")]
    pub cpu_chart: Vec<ChartPoint>,
    #[prost(message, repeated, tag = "2")]
    pub memory_chart: Vec<ChartPoint>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReportAgentFinishedRequest {
    #[prost(message, optional, tag = "1")]
    pub task_identification: Option<TaskIdentification>,
    #[prost(message, optional, tag = "2")]
    pub cache_retrieval_attempts: Option<CacheRetrievalAttempts>,
    #[prost(message, optional, tag = "3")]
    pub resource_utilization: Option<ResourceUtilization>,
    #[prost(message, repeated, tag = "4")]
    pub command_results: Vec<CommandResult>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReportAgentFinishedResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReportAgentProblemRequest {
    #[prost(message, optional, tag = "1")]
    pub task_identification: Option<TaskIdentification>,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(string, tag = "3")]
    pub stack: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReportAgentProblemResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReportAgentSignalRequest {
    #[prost(message, optional, tag = "1")]
    pub task_identification: Option<TaskIdentification>,
    #[prost(string, tag = "2")]
    pub signal: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReportAgentSignalResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReportAgentLogsRequest {
    #[prost(message, optional, tag = "1")]
    pub task_identification: Option<TaskIdentification>,
    #[prost(string, tag = "2")]
    pub logs: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReportAgentLogsResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReportStopHookRequest {
    #[prost(message, optional, tag = "1")]
    pub task_identification: Option<TaskIdentification>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReportStopHookResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeartbeatRequest {
    #[prost(message, optional, tag = "1")]
    pub task_identification: Option<TaskIdentification>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeartbeatResponse {}
