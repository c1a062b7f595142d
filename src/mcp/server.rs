//! stdio server: one process, one client.
//!
//! This module drives a [`ProtocolCore`] over newline-delimited JSON:
//!
//! 1. **Initialisation**: until a session exists, `initialize` requests are
//!    handled inline by [`ProtocolCore::process_initialize`], which admits
//!    them like any other frame and creates the session before answering
//! 2. **Operation**: every frame is processed on its own task; responses are
//!    funnelled through a single writer task so frames never interleave
//! 3. **Shutdown**: EOF, SIGINT or SIGTERM stops reading, lets in-flight
//!    requests finish and removes the client's state
//!
//! Responses to notifications are not written.

use std::io;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::mcp::context::RequestContext;
use crate::mcp::core::ProtocolCore;
use crate::mcp::handler::{MessageHandler, ResourceHandler, ResourceInfo};
use crate::mcp::protocol::{encode_response, ErrorCode, JsonRpcRequest, JsonRpcResponse};
use crate::mcp::router::SystemMethod;
use crate::mcp::transport::{LineReader, LineWriter};

/// URI of the built-in status resource.
pub const STATUS_URI: &str = "server://status";

/// Responses buffered between request tasks and the writer.
const OUTBOUND_CAPACITY: usize = 64;

/// Answers `ping` with an empty result.
#[derive(Debug, Default, Clone, Copy)]
pub struct PingHandler;

#[async_trait]
impl MessageHandler for PingHandler {
    async fn handle_request(
        &self,
        _ctx: &RequestContext,
        request: JsonRpcRequest,
    ) -> JsonRpcResponse {
        JsonRpcResponse::success(request.id, json!({}))
    }

    fn supported_methods(&self) -> Vec<String> {
        vec!["ping".to_string()]
    }
}

/// Serves engine statistics at [`STATUS_URI`].
#[derive(Debug, Clone)]
pub struct StatusResource {
    core: Weak<ProtocolCore>,
}

impl StatusResource {
    /// Creates a status resource for `core`.
    #[must_use]
    pub fn new(core: &Arc<ProtocolCore>) -> Self {
        Self {
            core: Arc::downgrade(core),
        }
    }
}

#[async_trait]
impl ResourceHandler for StatusResource {
    fn describe(&self) -> ResourceInfo {
        ResourceInfo {
            uri: STATUS_URI.to_string(),
            name: "Server status".to_string(),
            description: Some(
                "Session, rate limiting, capability and router statistics".to_string(),
            ),
            mime_type: Some("application/json".to_string()),
        }
    }

    async fn handle_resource(
        &self,
        ctx: &RequestContext,
        request: JsonRpcRequest,
    ) -> JsonRpcResponse {
        let Some(core) = self.core.upgrade() else {
            return ctx.error_response(ErrorCode::ResourceError, "Server is shutting down");
        };

        match serde_json::to_string(&core.stats()) {
            Ok(text) => JsonRpcResponse::success(
                request.id,
                json!({
                    "contents": [{
                        "uri": STATUS_URI,
                        "mimeType": "application/json",
                        "text": text,
                    }]
                }),
            ),
            Err(e) => ctx.error_response(ErrorCode::ResourceError, e.to_string()),
        }
    }
}

/// The stdio MCP server.
#[derive(Debug)]
pub struct StdioServer {
    core: Arc<ProtocolCore>,
    client_id: String,
}

impl StdioServer {
    /// Creates a server for `core` and registers the `ping` handler and the
    /// status resource.
    #[must_use]
    pub fn new(core: Arc<ProtocolCore>) -> Self {
        core.register_message_handler(&(Arc::new(PingHandler) as Arc<dyn MessageHandler>));
        core.router()
            .register_resource(STATUS_URI, Arc::new(StatusResource::new(&core)));

        Self {
            core,
            client_id: format!("stdio-{}", Uuid::new_v4()),
        }
    }

    /// The id under which this connection's client is tracked.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Serves stdin/stdout until EOF or a shutdown signal, with background
    /// maintenance running.
    ///
    /// # Errors
    ///
    /// Returns an error if stdio fails or signal handlers cannot be installed.
    pub async fn run(&self) -> io::Result<()> {
        let shutdown = CancellationToken::new();
        let signals = install_signal_handlers(shutdown.clone())?;
        let maintenance = self.core.spawn_maintenance(shutdown.clone());

        let result = self
            .serve(LineReader::stdin(), LineWriter::stdout(), shutdown.clone())
            .await;

        shutdown.cancel();
        signals.abort();
        if let Err(e) = maintenance.await {
            tracing::warn!(error = %e, "Maintenance task ended abnormally");
        }
        result
    }

    /// Serves one client over the given streams until EOF or `shutdown`.
    ///
    /// # Errors
    ///
    /// Returns an error if reading or writing fails.
    pub async fn serve<R, W>(
        &self,
        mut reader: LineReader<R>,
        writer: LineWriter<W>,
        shutdown: CancellationToken,
    ) -> io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let writer_task = tokio::spawn(write_frames(writer, rx));
        let mut in_flight = JoinSet::new();
        let mut initialized = false;

        tracing::info!(client_id = %self.client_id, "Waiting for client messages");

        let read_result = loop {
            let frame = tokio::select! {
                () = shutdown.cancelled() => {
                    tracing::info!("Shutdown requested, stopping input");
                    break Ok(());
                }
                frame = reader.read_frame() => frame,
            };

            let frame = match frame {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    tracing::info!("Client closed input");
                    break Ok(());
                }
                Err(e) => break Err(e),
            };

            if frame.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            if !initialized && names_initialize(&frame) {
                // Earlier frames are admitted before the handshake.
                while in_flight.join_next().await.is_some() {}
                let outcome = self
                    .core
                    .process_initialize(&self.client_id, &frame, shutdown.child_token())
                    .await;
                initialized = outcome.initialized;
                if !outcome.processed.notification {
                    send_response(&tx, &outcome.processed.response).await;
                }
                continue;
            }

            let core = Arc::clone(&self.core);
            let client_id = self.client_id.clone();
            let tx = tx.clone();
            let cancellation = shutdown.child_token();
            in_flight.spawn(async move {
                let processed = core.process(&client_id, &frame, cancellation).await;
                if !processed.notification {
                    send_response(&tx, &processed.response).await;
                }
            });

            while in_flight.try_join_next().is_some() {}
        };

        while in_flight.join_next().await.is_some() {}
        drop(tx);

        let write_result = writer_task
            .await
            .unwrap_or_else(|e| Err(io::Error::other(e)));

        self.core.cleanup_client(&self.client_id);
        tracing::info!(client_id = %self.client_id, "Client disconnected");

        read_result.and(write_result)
    }
}

/// Whether `frame` looks like an `initialize` call. Admission decides the
/// rest.
fn names_initialize(frame: &[u8]) -> bool {
    serde_json::from_slice::<Value>(frame).is_ok_and(|value| {
        value.get("method").and_then(Value::as_str) == Some(SystemMethod::Initialize.as_str())
    })
}

async fn send_response(tx: &mpsc::Sender<Vec<u8>>, response: &JsonRpcResponse) {
    match encode_response(response) {
        Ok(frame) => {
            if tx.send(frame).await.is_err() {
                tracing::debug!("Writer stopped, dropping response");
            }
        }
        Err(e) => tracing::error!(error = %e, "Failed to encode response"),
    }
}

async fn write_frames<W>(
    mut writer: LineWriter<W>,
    mut rx: mpsc::Receiver<Vec<u8>>,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        if let Err(e) = writer.write_frame(&frame).await {
            tracing::error!(error = %e, "Failed to write response");
            return Err(e);
        }
    }
    Ok(())
}

/// Cancels `shutdown` on SIGINT or SIGTERM.
#[cfg(unix)]
fn install_signal_handlers(shutdown: CancellationToken) -> io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => tracing::info!("Received SIGINT, initiating graceful shutdown"),
            _ = sigterm.recv() => tracing::info!("Received SIGTERM, initiating graceful shutdown"),
        }
        shutdown.cancel();
    }))
}

/// Cancels `shutdown` on Ctrl+C.
#[cfg(windows)]
fn install_signal_handlers(shutdown: CancellationToken) -> io::Result<JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
            shutdown.cancel();
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::collections::HashMap;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    async fn run_session(core: Arc<ProtocolCore>, input: &str) -> (Vec<Value>, Arc<ProtocolCore>) {
        let server = StdioServer::new(Arc::clone(&core));
        let (mut client_in, server_in) = tokio::io::duplex(64 * 1024);
        let (server_out, client_out) = tokio::io::duplex(64 * 1024);

        client_in.write_all(input.as_bytes()).await.unwrap();
        drop(client_in);

        server
            .serve(
                LineReader::new(BufReader::new(server_in)),
                LineWriter::new(server_out),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let mut lines = BufReader::new(client_out).lines();
        let mut responses = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            responses.push(serde_json::from_str(&line).unwrap());
        }
        (responses, core)
    }

    fn by_id(responses: &[Value]) -> HashMap<String, Value> {
        responses
            .iter()
            .map(|r| (r["id"].to_string(), r.clone()))
            .collect()
    }

    #[tokio::test]
    async fn serves_a_session() {
        let core = Arc::new(ProtocolCore::new(&Config::default()));
        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2024-11-05","clientInfo":{"name":"t","version":"0"}}}"#,
            "\n",
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            "\n\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":3,"method":"resources/read","params":{"uri":"server://status"}}"#,
            "\n",
            "not json\n",
        );

        let (responses, core) = run_session(core, input).await;
        assert_eq!(responses.len(), 4);

        let responses = by_id(&responses);
        assert_eq!(responses["1"]["result"]["serverInfo"]["name"], json!("acmg-mcp-engine"));
        assert_eq!(responses["2"]["result"], json!({}));

        let text = responses["3"]["result"]["contents"][0]["text"].as_str().unwrap();
        let stats: Value = serde_json::from_str(text).unwrap();
        assert_eq!(stats["sessions"]["active_sessions"], json!(1));

        assert_eq!(responses["null"]["error"]["code"], json!(-32700));

        // Client state is gone once the input closes.
        assert_eq!(core.sessions().session_count(), 0);
        assert_eq!(core.stats().rate_limit.total_clients, 0);
    }

    fn blocking_limits(max_violations: u32) -> Config {
        let mut config = Config::default();
        config.rate_limit.requests_per_window = 1;
        config.rate_limit.burst_limit = 1;
        config.rate_limit.max_violations = max_violations;
        config.rate_limit.block_secs = 3600;
        config
    }

    #[tokio::test]
    async fn failing_initializes_are_rate_limited() {
        let core = Arc::new(ProtocolCore::new(&blocking_limits(1)));
        let input: String = (0..5)
            .map(|id| {
                let frame = json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "method": "initialize",
                    "params": {"protocolVersion": "1999"}
                });
                format!("{frame}\n")
            })
            .collect();

        let (responses, _core) = run_session(core, &input).await;
        assert_eq!(responses.len(), 5);
        let responses = by_id(&responses);
        assert_eq!(responses["0"]["error"]["code"], json!(-32602));
        for id in 1..5 {
            assert_eq!(responses[&id.to_string()]["error"]["code"], json!(-32001));
        }
        assert_eq!(responses["1"]["error"]["data"], json!("burst limit exceeded"));
        assert_eq!(responses["4"]["error"]["data"], json!("client blocked"));
    }

    #[tokio::test]
    async fn block_survives_failed_initialize() {
        let core = Arc::new(ProtocolCore::new(&blocking_limits(1)));
        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":3,"method":"initialize","params":{"protocolVersion":"1999"}}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":4,"method":"ping"}"#,
            "\n",
        );

        let (responses, _core) = run_session(core, input).await;
        let responses = by_id(&responses);
        assert_eq!(responses["1"]["result"], json!({}));
        assert_eq!(responses["2"]["error"]["code"], json!(-32001));
        assert_eq!(responses["3"]["error"]["data"], json!("client blocked"));
        assert_eq!(responses["4"]["error"]["code"], json!(-32001));
        assert_eq!(responses["4"]["error"]["data"], json!("client blocked"));
    }

    #[tokio::test]
    async fn initialize_with_wrong_version_creates_no_session() {
        let core = Arc::new(ProtocolCore::new(&Config::default()));
        let input = concat!(
            r#"{"jsonrpc":"1.0","id":1,"method":"initialize","params":{"protocolVersion":"2024-11-05"}}"#,
            "\n",
            r#"{"jsonrpc":null,"id":2,"method":"initialize","params":{"protocolVersion":"2024-11-05"}}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":3,"method":"resources/read","params":{"uri":"server://status"}}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":4,"method":"initialize","params":{"protocolVersion":"2024-11-05"}}"#,
            "\n",
        );

        let (responses, _core) = run_session(core, input).await;
        let responses = by_id(&responses);
        assert_eq!(responses["1"]["error"]["code"], json!(-32600));
        assert_eq!(responses["2"]["error"]["code"], json!(-32600));

        let text = responses["3"]["result"]["contents"][0]["text"].as_str().unwrap();
        let stats: Value = serde_json::from_str(text).unwrap();
        assert_eq!(stats["sessions"]["active_sessions"], json!(0));

        assert_eq!(responses["4"]["result"]["protocolVersion"], json!("2024-11-05"));
    }

    #[tokio::test]
    async fn rejects_incompatible_initialize() {
        let core = Arc::new(ProtocolCore::new(&Config::default()));
        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"1999-01-01"}}"#,
            "\n",
        );

        let (responses, core) = run_session(core, input).await;
        assert_eq!(responses.len(), 1);
        let error = &responses[0]["error"];
        assert_eq!(error["code"], json!(-32602));
        assert!(error["data"]
            .as_str()
            .unwrap()
            .contains("no compatible protocol version"));
        assert_eq!(core.stats().capabilities.negotiated_clients, 0);
    }

    #[tokio::test]
    async fn shutdown_stops_reading() {
        let core = Arc::new(ProtocolCore::new(&Config::default()));
        let server = StdioServer::new(core);
        let (_client_in, server_in) = tokio::io::duplex(1024);
        let (server_out, _client_out) = tokio::io::duplex(1024);

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        server
            .serve(
                LineReader::new(BufReader::new(server_in)),
                LineWriter::new(server_out),
                shutdown,
            )
            .await
            .unwrap();
    }
}
