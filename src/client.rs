//! Reconnecting, retrying RPC channel to the controller.
//!
//! The controller API is consumed through the [`AgentTransport`] trait so
//! the executor can be driven against an in-memory transport in tests;
//! [`GrpcTransport`] is the production implementation.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::net::UnixStream;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint, Uri};
use tonic::{Code, Status};
use tower::service_fn;
use tracing::warn;

use crate::api;
use crate::errors::{Error, Result};

const MAX_ATTEMPTS: u32 = 3;
const PER_RETRY_TIMEOUT: Duration = Duration::from_secs(10);
const DIAL_TIMEOUT: Duration = Duration::from_secs(60);

const RETRYABLE_CODES: &[Code] = &[
    Code::Unavailable,
    Code::Internal,
    Code::Unknown,
    Code::ResourceExhausted,
    Code::DeadlineExceeded,
];

/// Controller RPC surface consumed by the agent.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn initial_commands(
        &self,
        request: api::InitialCommandsRequest,
    ) -> std::result::Result<api::CommandsResponse, Status>;

    async fn report_command_updates(
        &self,
        request: api::ReportCommandUpdatesRequest,
    ) -> std::result::Result<(), Status>;

    async fn report_command_logs(
        &self,
        request: api::ReportCommandLogsRequest,
    ) -> std::result::Result<(), Status>;

    async fn report_agent_finished(
        &self,
        request: api::ReportAgentFinishedRequest,
    ) -> std::result::Result<(), Status>;

    async fn report_agent_error(
        &self,
        request: api::ReportAgentProblemRequest,
    ) -> std::result::Result<(), Status>;

    async fn report_agent_warning(
        &self,
        request: api::ReportAgentProblemRequest,
    ) -> std::result::Result<(), Status>;

    async fn report_agent_signal(
        &self,
        request: api::ReportAgentSignalRequest,
    ) -> std::result::Result<(), Status>;

    async fn report_agent_logs(
        &self,
        request: api::ReportAgentLogsRequest,
    ) -> std::result::Result<(), Status>;

    async fn report_stop_hook(
        &self,
        request: api::ReportStopHookRequest,
    ) -> std::result::Result<(), Status>;

    async fn heartbeat(&self, request: api::HeartbeatRequest) -> std::result::Result<(), Status>;

    /// Drop the current connection and re-establish it lazily, so the next
    /// call does not wait out an accumulated backoff window.
    fn reset_connection(&self);
}

/// How an endpoint string maps onto a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSettings {
    /// TLS towards `https://host[:port]`.
    Tls { uri: String },
    /// Plaintext towards `http://host[:port]`.
    Plain { uri: String },
    /// Plaintext over a Unix domain socket.
    Unix { path: String },
}

/// Endpoint-form table: `https://` and bare endpoints are secure,
/// `http://` and `unix://` are not.
pub fn transport_settings(api_endpoint: &str) -> TransportSettings {
    if let Some(path) = api_endpoint.strip_prefix("unix://") {
        return TransportSettings::Unix {
            path: path.to_string(),
        };
    }
    if let Some(rest) = api_endpoint.strip_prefix("http://") {
        return TransportSettings::Plain {
            uri: format!("http://{rest}"),
        };
    }
    if api_endpoint.starts_with("https://") {
        return TransportSettings::Tls {
            uri: api_endpoint.to_string(),
        };
    }
    TransportSettings::Tls {
        uri: format!("https://{api_endpoint}"),
    }
}

pub struct GrpcTransport {
    endpoint: Endpoint,
    unix_path: Option<String>,
    channel: RwLock<Channel>,
}

impl GrpcTransport {
    /// One blocking dial attempt with a 1-minute timeout. Launch-time
    /// resilience (the infinite 1-second retry loop) lives with the caller.
    pub async fn dial(api_endpoint: &str) -> Result<Self> {
        let settings = transport_settings(api_endpoint);

        let (endpoint, unix_path) = match &settings {
            TransportSettings::Tls { uri } => {
                let tls = ClientTlsConfig::new()
                    .with_webpki_roots()
                    .with_native_roots();
                let endpoint = Endpoint::from_shared(uri.clone())
                    .map_err(|e| Error::configuration(format!("invalid endpoint '{uri}': {e}")))?
                    .connect_timeout(DIAL_TIMEOUT)
                    .tls_config(tls)
                    .map_err(|e| Error::configuration(format!("TLS configuration: {e}")))?;
                (endpoint, None)
            }
            TransportSettings::Plain { uri } => {
                let endpoint = Endpoint::from_shared(uri.clone())
                    .map_err(|e| Error::configuration(format!("invalid endpoint '{uri}': {e}")))?
                    .connect_timeout(DIAL_TIMEOUT);
                (endpoint, None)
            }
            TransportSettings::Unix { path } => {
                // The URI is ignored by the connector but must parse.
                let endpoint =
                    Endpoint::from_static("http://[::1]:50051").connect_timeout(DIAL_TIMEOUT);
                (endpoint, Some(path.clone()))
            }
        };

        let channel = match &unix_path {
            Some(path) => {
                let path = path.clone();
                endpoint
                    .connect_with_connector(service_fn(move |_: Uri| {
                        let path = path.clone();
                        async move {
                            Ok::<_, std::io::Error>(hyper_util::rt::TokioIo::new(
                                UnixStream::connect(path).await?,
                            ))
                        }
                    }))
                    .await
            }
            None => endpoint.connect().await,
        }
        .map_err(|e| Error::rpc("dial", e.to_string()))?;

        Ok(Self {
            endpoint,
            unix_path,
            channel: RwLock::new(channel),
        })
    }

    async fn unary<Req, Resp>(
        &self,
        method: &'static str,
        path: &'static str,
        request: Req,
    ) -> std::result::Result<Resp, Status>
    where
        Req: prost::Message + Clone + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let channel = self.channel.read().clone();
            let mut grpc = tonic::client::Grpc::new(channel);
            let request = request.clone();

            let outcome = tokio::time::timeout(PER_RETRY_TIMEOUT, async move {
                grpc.ready()
                    .await
                    .map_err(|e| Status::unknown(format!("service was not ready: {e}")))?;
                let codec: ProstCodec<Req, Resp> = ProstCodec::default();
                grpc.unary(
                    tonic::Request::new(request),
                    PathAndQuery::from_static(path),
                    codec,
                )
                .await
            })
            .await;

            match outcome {
                Ok(Ok(response)) => return Ok(response.into_inner()),
                Ok(Err(status)) => {
                    if attempt < MAX_ATTEMPTS && RETRYABLE_CODES.contains(&status.code()) {
                        warn!(method, attempt, error = %status, "retrying unary call");
                        continue;
                    }
                    return Err(status);
                }
                Err(_elapsed) => {
                    if attempt < MAX_ATTEMPTS {
                        warn!(method, attempt, "unary call timed out, retrying");
                        continue;
                    }
                    return Err(Status::deadline_exceeded(format!(
                        "{method} did not complete within {PER_RETRY_TIMEOUT:?}"
                    )));
                }
            }
        }
    }
}

#[async_trait]
impl AgentTransport for GrpcTransport {
    async fn initial_commands(
        &self,
        request: api::InitialCommandsRequest,
    ) -> std::result::Result<api::CommandsResponse, Status> {
        self.unary(
            "InitialCommands",
            "/org.cirruslabs.ci.services.cirruscigrpc.CirrusCIService/InitialCommands",
            request,
        )
        .await
    }

    async fn report_command_updates(
        &self,
        request: api::ReportCommandUpdatesRequest,
    ) -> std::result::Result<(), Status> {
        let _: api::ReportCommandUpdatesResponse = self
            .unary(
                "ReportCommandUpdates",
                "/org.cirruslabs.ci.services.cirruscigrpc.CirrusCIService/ReportCommandUpdates",
                request,
            )
            .await?;
        Ok(())
    }

    async fn report_command_logs(
        &self,
        request: api::ReportCommandLogsRequest,
    ) -> std::result::Result<(), Status> {
        let _: api::ReportCommandLogsResponse = self
            .unary(
                "ReportCommandLogs",
                "/org.cirruslabs.ci.services.cirruscigrpc.CirrusCIService/ReportCommandLogs",
                request,
            )
            .await?;
        Ok(())
    }

    async fn report_agent_finished(
        &self,
        request: api::ReportAgentFinishedRequest,
    ) -> std::result::Result<(), Status> {
        let _: api::ReportAgentFinishedResponse = self
            .unary(
                "ReportAgentFinished",
                "/org.cirruslabs.ci.services.cirruscigrpc.CirrusCIService/ReportAgentFinished",
                request,
            )
            .await?;
        Ok(())
    }

    async fn report_agent_error(
        &self,
        request: api::ReportAgentProblemRequest,
    ) -> std::result::Result<(), Status> {
        let _: api::ReportAgentProblemResponse = self
            .unary(
                "ReportAgentError",
                "/org.cirruslabs.ci.services.cirruscigrpc.CirrusCIService/ReportAgentError",
                request,
            )
            .await?;
        Ok(())
    }

    async fn report_agent_warning(
        &self,
        request: api::ReportAgentProblemRequest,
    ) -> std::result::Result<(), Status> {
        let _: api::ReportAgentProblemResponse = self
            .unary(
                "ReportAgentWarning",
                "/org.cirruslabs.ci.services.cirruscigrpc.CirrusCIService/ReportAgentWarning",
                request,
            )
            .await?;
        Ok(())
    }

    async fn report_agent_signal(
        &self,
        request: api::ReportAgentSignalRequest,
    ) -> std::result::Result<(), Status> {
        let _: api::ReportAgentSignalResponse = self
            .unary(
                "ReportAgentSignal",
                "/org.cirruslabs.ci.services.cirruscigrpc.CirrusCIService/ReportAgentSignal",
                request,
            )
            .await?;
        Ok(())
    }

    async fn report_agent_logs(
        &self,
        request: api::ReportAgentLogsRequest,
    ) -> std::result::Result<(), Status> {
        let _: api::ReportAgentLogsResponse = self
            .unary(
                "ReportAgentLogs",
                "/org.cirruslabs.ci.services.cirruscigrpc.CirrusCIService/ReportAgentLogs",
                request,
            )
            .await?;
        Ok(())
    }

    async fn report_stop_hook(
        &self,
        request: api::ReportStopHookRequest,
    ) -> std::result::Result<(), Status> {
        let _: api::ReportStopHookResponse = self
            .unary(
                "ReportStopHook",
                "/org.cirruslabs.ci.services.cirruscigrpc.CirrusCIService/ReportStopHook",
                request,
            )
            .await?;
        Ok(())
    }

    async fn heartbeat(&self, request: api::HeartbeatRequest) -> std::result::Result<(), Status> {
        let _: api::HeartbeatResponse = self
            .unary(
                "Heartbeat",
                "/org.cirruslabs.ci.services.cirruscigrpc.CirrusCIService/Heartbeat",
                request,
            )
            .await?;
        Ok(())
    }

    fn reset_connection(&self) {
        let channel = match &self.unix_path {
            Some(path) => {
                let path = path.clone();
                self.endpoint
                    .connect_with_connector_lazy(service_fn(move |_: Uri| {
                        let path = path.clone();
                        async move {
                            Ok::<_, std::io::Error>(hyper_util::rt::TokioIo::new(
                                UnixStream::connect(path).await?,
                            ))
                        }
                    }))
            }
            None => self.endpoint.connect_lazy(),
        };
        *self.channel.write() = channel;
    }
}
