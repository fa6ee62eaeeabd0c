//! Client session for a subprocess tool server.
//!
//! A session owns one [`Transport`] and multiplexes requests over it. A
//! background reader task is the single consumer of incoming frames; it
//! resolves pending requests by correlation id, so responses may arrive in
//! any order and many calls may be in flight at once.
//!
//! ```rust,ignore
//! let session = McpSession::spawn_stdio(&server_config, SessionOptions::default())?;
//! session.initialize().await?;
//! let tools = session.list_tools().await?;
//! let result = session.call_tool("current_time", args).await?;
//! session.shutdown().await?;
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ServerConfig, SessionConfig};
use crate::error::{AgentError, Result};
use crate::protocol::{
    CallToolResult, CapabilitySet, Frame, Implementation, InitializeParams, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, ListToolsResult, METHOD_CALL_TOOL, METHOD_INITIALIZE,
    METHOD_INITIALIZED, METHOD_LIST_TOOLS, METHOD_NOT_FOUND, METHOD_PING, PROTOCOL_VERSION,
};
use crate::tool::ToolDescriptor;
use crate::transport::{StdioTransport, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Ready,
    Closed,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub server_name: String,
    pub request_timeout: Duration,
    pub client_info: Implementation,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            server_name: "tool-server".into(),
            request_timeout: Duration::from_secs(60),
            client_info: Implementation {
                name: env!("CARGO_PKG_NAME").into(),
                version: Some(env!("CARGO_PKG_VERSION").into()),
            },
        }
    }
}

impl SessionOptions {
    pub fn from_config(server: &ServerConfig, session: &SessionConfig) -> Self {
        Self {
            server_name: server.name.clone(),
            request_timeout: session.request_timeout(),
            ..Self::default()
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// An in-flight request awaiting its response.
struct PendingRequest {
    method: String,
    sent_at: Instant,
    responder: oneshot::Sender<JsonRpcResponse>,
}

/// State and pending map share one lock so that admission checks and
/// teardown cannot interleave.
struct Inner {
    state: SessionState,
    pending: HashMap<u64, PendingRequest>,
    capabilities: Option<CapabilitySet>,
}

impl Inner {
    fn admit(&self, expected: SessionState) -> Result<()> {
        match (self.state, expected) {
            (SessionState::Closed, _) => Err(AgentError::SessionClosed),
            (actual, expected) if actual == expected => Ok(()),
            (SessionState::Uninitialized, _) => Err(AgentError::NotReady),
            (SessionState::Ready, _) => {
                Err(AgentError::Protocol("session is already initialized".into()))
            }
        }
    }

    fn close(&mut self) -> HashMap<u64, PendingRequest> {
        self.state = SessionState::Closed;
        std::mem::take(&mut self.pending)
    }
}

pub struct McpSession {
    options: SessionOptions,
    transport: Arc<dyn Transport>,
    inner: Arc<Mutex<Inner>>,
    next_id: AtomicU64,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl McpSession {
    /// Wrap a transport and start the reader task. Must be called inside a
    /// tokio runtime.
    pub fn start(transport: Arc<dyn Transport>, options: SessionOptions) -> Self {
        let inner = Arc::new(Mutex::new(Inner {
            state: SessionState::Uninitialized,
            pending: HashMap::new(),
            capabilities: None,
        }));

        let reader = tokio::spawn(Self::reader_loop(
            options.server_name.clone(),
            Arc::clone(&transport),
            Arc::clone(&inner),
        ));

        Self {
            options,
            transport,
            inner,
            next_id: AtomicU64::new(1),
            reader: Mutex::new(Some(reader)),
        }
    }

    /// Launch the configured server process and attach a session to it.
    pub fn spawn_stdio(server: &ServerConfig, options: SessionOptions) -> Result<Self> {
        let transport = StdioTransport::from_config(server)?;
        Ok(Self::start(Arc::new(transport), options))
    }

    pub fn server_name(&self) -> &str {
        &self.options.server_name
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    pub async fn capabilities(&self) -> Option<CapabilitySet> {
        self.inner.lock().await.capabilities.clone()
    }

    /// Number of requests still waiting for a response.
    pub async fn pending_requests(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    /// Perform the initialize handshake and move to `Ready`.
    pub async fn initialize(&self) -> Result<CapabilitySet> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.into(),
            capabilities: json!({}),
            client_info: self.options.client_info.clone(),
        };
        let response = self
            .request(
                METHOD_INITIALIZE,
                Some(serde_json::to_value(params)?),
                SessionState::Uninitialized,
            )
            .await?;

        if let Some(error) = response.error {
            return Err(AgentError::Protocol(format!("initialize rejected: {error}")));
        }
        let result = response
            .result
            .ok_or_else(|| AgentError::Protocol("initialize response has no result".into()))?;
        let capabilities: CapabilitySet = serde_json::from_value(result).map_err(|err| {
            AgentError::Protocol(format!("malformed initialize result: {err}"))
        })?;

        let notification = serde_json::to_string(&JsonRpcNotification::new(METHOD_INITIALIZED))?;
        self.transport.send(&notification).await?;

        let mut inner = self.inner.lock().await;
        inner.admit(SessionState::Uninitialized)?;
        inner.state = SessionState::Ready;
        inner.capabilities = Some(capabilities.clone());
        drop(inner);

        info!(
            server = %self.options.server_name,
            remote = %capabilities.server_info.name,
            protocol = %capabilities.protocol_version,
            "tool server session ready"
        );
        Ok(capabilities)
    }

    /// List every tool the server advertises, following pagination.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = cursor.take().map(|cursor| json!({ "cursor": cursor }));
            let response = self
                .request(METHOD_LIST_TOOLS, params, SessionState::Ready)
                .await?;
            if let Some(error) = response.error {
                return Err(AgentError::Protocol(format!("tools/list failed: {error}")));
            }
            let page: ListToolsResult = serde_json::from_value(response.result.unwrap_or_default())
                .map_err(|err| AgentError::Protocol(format!("malformed tools/list result: {err}")))?;

            tools.extend(page.tools.into_iter().map(ToolDescriptor::from));
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        debug!(server = %self.options.server_name, count = tools.len(), "listed remote tools");
        Ok(tools)
    }

    /// Invoke a remote tool and wait for its result.
    pub async fn call_tool(&self, name: &str, arguments: Map<String, Value>) -> Result<CallToolResult> {
        let params = json!({ "name": name, "arguments": arguments });
        let response = self
            .request(METHOD_CALL_TOOL, Some(params), SessionState::Ready)
            .await?;

        if let Some(error) = response.error {
            return Err(AgentError::tool(name, error.to_string()));
        }
        let result: CallToolResult = serde_json::from_value(response.result.unwrap_or_default())
            .map_err(|err| AgentError::Protocol(format!("malformed tools/call result: {err}")))?;
        if result.is_error {
            return Err(AgentError::tool(name, result.render()));
        }
        Ok(result)
    }

    /// Close the session. Waiters fail with `SessionClosed`. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        let cancelled = self.inner.lock().await.close();
        if !cancelled.is_empty() {
            debug!(
                server = %self.options.server_name,
                count = cancelled.len(),
                "cancelling pending requests"
            );
        }
        drop(cancelled);

        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
            info!(server = %self.options.server_name, "tool server session closed");
        }
        self.transport.close().await
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        expected: SessionState,
    ) -> Result<JsonRpcResponse> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;
        let (tx, rx) = oneshot::channel();

        {
            let mut inner = self.inner.lock().await;
            inner.admit(expected)?;
            inner.pending.insert(
                id,
                PendingRequest {
                    method: method.to_string(),
                    sent_at: Instant::now(),
                    responder: tx,
                },
            );
        }

        // One deadline covers the write and the wait for the response.
        let exchange = async {
            self.transport.send(&frame).await?;
            rx.await.map_err(|_| AgentError::SessionClosed)
        };

        match tokio::time::timeout(self.options.request_timeout, exchange).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => {
                self.inner.lock().await.pending.remove(&id);
                Err(err)
            }
            Err(_) => {
                let elapsed = self
                    .inner
                    .lock()
                    .await
                    .pending
                    .remove(&id)
                    .map(|pending| pending.sent_at.elapsed())
                    .unwrap_or(self.options.request_timeout);
                warn!(server = %self.options.server_name, id, method, ?elapsed, "request timed out");
                Err(AgentError::Timeout {
                    method: method.to_string(),
                    elapsed,
                })
            }
        }
    }

    async fn reader_loop(server: String, transport: Arc<dyn Transport>, inner: Arc<Mutex<Inner>>) {
        loop {
            let line = match transport.receive().await {
                Ok(line) => line,
                Err(AgentError::Eof) => {
                    info!(%server, "tool server closed its output");
                    break;
                }
                Err(err) => {
                    warn!(%server, error = %err, "tool server read failed");
                    break;
                }
            };

            match Frame::parse(&line) {
                Ok(Frame::Response(response)) => {
                    let Some(id) = response.id.as_u64() else {
                        warn!(%server, id = %response.id, "discarding response with foreign id");
                        continue;
                    };
                    let pending = inner.lock().await.pending.remove(&id);
                    match pending {
                        Some(pending) => {
                            debug!(
                                %server,
                                id,
                                method = %pending.method,
                                elapsed = ?pending.sent_at.elapsed(),
                                "response routed"
                            );
                            let _ = pending.responder.send(response);
                        }
                        None => warn!(%server, id, "discarding response with no pending request"),
                    }
                }
                Ok(Frame::Request(request)) => {
                    let reply = if request.method == METHOD_PING {
                        JsonRpcResponse::success(request.id, json!({}))
                    } else {
                        debug!(%server, method = %request.method, "rejecting server request");
                        JsonRpcResponse::failure(
                            request.id,
                            METHOD_NOT_FOUND,
                            format!("method not found: {}", request.method),
                        )
                    };
                    match serde_json::to_string(&reply) {
                        Ok(frame) => {
                            if let Err(err) = transport.send(&frame).await {
                                warn!(%server, error = %err, "failed to answer server request");
                            }
                        }
                        Err(err) => warn!(%server, error = %err, "failed to encode reply"),
                    }
                }
                Ok(Frame::Notification(notification)) => {
                    debug!(%server, method = %notification.method, "server notification");
                }
                Err(err) => {
                    warn!(%server, error = %err, frame = %line, "discarding malformed frame");
                }
            }
        }

        let failed = inner.lock().await.close();
        if !failed.is_empty() {
            warn!(%server, count = failed.len(), "failing pending requests after transport loss");
        }
    }
}

impl Drop for McpSession {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}
