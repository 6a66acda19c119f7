use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use rmcp::model::{
    CallToolRequest, CancelledNotificationParam, ClientJsonRpcMessage, ClientNotification,
    ClientRequest, CompleteRequest, CompleteRequestParam, CreateMessageRequestParam,
    CreateMessageResult, CreateElicitationRequestParam, CreateElicitationResult, ErrorCode,
    ErrorData, GetPromptRequest, Implementation, InitializeResult, JsonRpcMessage,
    ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult, ListRootsResult,
    ListToolsResult, LoggingLevel, LoggingMessageNotificationParam, Meta,
    ProgressNotificationParam, ProtocolVersion, ReadResourceRequest, RequestId, ServerResult,
};
use rmcp::service::{PeerRequestOptions, ServiceError};
use serde_json::{json, Value as JsonValue};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::capabilities::Section;
use crate::client_session::ClientSession;
use crate::config::DangerLevel;
use crate::context::ServerContext;
use crate::event_store::EventStore;
use crate::events::{ApprovalDecision, ApprovalGateway, ApprovalRequest, PendingApprovals};
use crate::handler::request_id_string;
use crate::idmap::{MappedRequest, RequestIdMapper};
use crate::logging::{LogEvent, LogKind, LogPublisher};
use crate::supervisor::{ListKind, ServerSupervisor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReverseKind {
    Sampling,
    Roots,
    Elicitation,
}

impl ReverseKind {
    fn method(self) -> &'static str {
        match self {
            ReverseKind::Sampling => "sampling/createMessage",
            ReverseKind::Roots => "roots/list",
            ReverseKind::Elicitation => "elicitation/create",
        }
    }
}

/// The hybrid endpoint: MCP server to the connected client, MCP client (via
/// the supervisor's contexts) to every downstream. All client-facing frames
/// leave through the session's event store so a resumed stream can replay.
pub struct ProxySession {
    client: Arc<ClientSession>,
    supervisor: Arc<ServerSupervisor>,
    store: Arc<EventStore>,
    idmap: RequestIdMapper,
    pending_reverse: Mutex<HashMap<String, oneshot::Sender<Result<JsonValue, ErrorData>>>>,
    reverse_seq: AtomicU64,
    approvals: Arc<dyn ApprovalGateway>,
    logger: Arc<dyn LogPublisher>,
    log_level: RwLock<Option<LoggingLevel>>,
    closed: AtomicBool,
}

impl ProxySession {
    pub fn new(
        client: Arc<ClientSession>,
        supervisor: Arc<ServerSupervisor>,
        store: Arc<EventStore>,
        approvals: Arc<dyn ApprovalGateway>,
        logger: Arc<dyn LogPublisher>,
    ) -> Arc<Self> {
        let session_id = client.session_id.clone();
        Arc::new(Self {
            client,
            supervisor,
            store,
            idmap: RequestIdMapper::new(session_id),
            pending_reverse: Mutex::new(HashMap::new()),
            reverse_seq: AtomicU64::new(0),
            approvals,
            logger,
            log_level: RwLock::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.client.session_id
    }

    pub fn client(&self) -> &Arc<ClientSession> {
        &self.client
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    pub fn idmap(&self) -> &RequestIdMapper {
        &self.idmap
    }

    /// Entry point for every frame the client POSTs. Requests produce a
    /// response frame; notifications and reverse-response frames produce
    /// nothing. A cancelled forward suppresses its response entirely.
    pub async fn handle_message(&self, message: ClientJsonRpcMessage) -> Option<JsonValue> {
        self.client.touch();
        match message {
            JsonRpcMessage::Request(envelope) => {
                let id = envelope.id.clone();
                match self.handle_request(envelope.request, &id).await {
                    Ok(Some(result)) => response_frame(result, &id),
                    Ok(None) => None,
                    Err(error) => error_frame(error, &id),
                }
            }
            JsonRpcMessage::Notification(envelope) => {
                self.handle_notification(envelope.notification).await;
                None
            }
            JsonRpcMessage::Response(envelope) => {
                let value = serde_json::to_value(&envelope.result).unwrap_or(JsonValue::Null);
                self.complete_reverse(&envelope.id, Ok(value));
                None
            }
            JsonRpcMessage::Error(envelope) => {
                self.complete_reverse(&envelope.id, Err(envelope.error));
                None
            }
            other => {
                debug!(target = "proxy", session = %self.session_id(), "unsupported frame: {other:?}");
                None
            }
        }
    }

    async fn handle_request(
        &self,
        request: ClientRequest,
        id: &RequestId,
    ) -> Result<Option<ServerResult>, ErrorData> {
        let started = Instant::now();
        match request {
            ClientRequest::InitializeRequest(r) => {
                self.client.set_client_details(
                    Some(r.params.client_info.clone()),
                    Some(r.params.capabilities.clone()),
                );
                let result = InitializeResult {
                    protocol_version: ProtocolVersion::default(),
                    capabilities: self.client.advertised_capabilities(),
                    server_info: Implementation {
                        name: "mcp-switchboard".into(),
                        title: Some("MCP Switchboard".into()),
                        version: env!("CARGO_PKG_VERSION").into(),
                        icons: None,
                        website_url: None,
                    },
                    instructions: None,
                };
                Ok(Some(ServerResult::InitializeResult(result)))
            }
            ClientRequest::PingRequest(_) => Ok(Some(ServerResult::empty(()))),
            ClientRequest::SetLevelRequest(r) => {
                *self.log_level.write().unwrap() = Some(r.params.level);
                Ok(Some(ServerResult::empty(())))
            }
            ClientRequest::ListToolsRequest(_) => {
                let tools = self.client.list_tools().await;
                self.log_list(LogKind::ResponseToolList, id, tools.len(), started);
                Ok(Some(ServerResult::ListToolsResult(ListToolsResult {
                    tools,
                    next_cursor: None,
                })))
            }
            ClientRequest::ListResourcesRequest(_) => {
                let resources = self.client.list_resources().await;
                self.log_list(LogKind::ResponseResourceList, id, resources.len(), started);
                Ok(Some(ServerResult::ListResourcesResult(
                    ListResourcesResult {
                        resources,
                        next_cursor: None,
                    },
                )))
            }
            ClientRequest::ListResourceTemplatesRequest(_) => {
                let resource_templates = self.client.list_resource_templates().await;
                self.log_list(
                    LogKind::ResponseResourceList,
                    id,
                    resource_templates.len(),
                    started,
                );
                Ok(Some(ServerResult::ListResourceTemplatesResult(
                    ListResourceTemplatesResult {
                        resource_templates,
                        next_cursor: None,
                    },
                )))
            }
            ClientRequest::ListPromptsRequest(_) => {
                let prompts = self.client.list_prompts().await;
                self.log_list(LogKind::ResponsePromptList, id, prompts.len(), started);
                Ok(Some(ServerResult::ListPromptsResult(ListPromptsResult {
                    prompts,
                    next_cursor: None,
                })))
            }
            ClientRequest::CallToolRequest(r) => {
                let prefixed = r.params.name.to_string();
                let (ctx, original, _user) = self.client.resolve(Section::Tools, &prefixed).await?;
                let danger = self.client.danger_for(&ctx, &original).await?;
                if danger == DangerLevel::Approval {
                    self.confirm_tool_call(&ctx, &original, r.params.arguments.as_ref())
                        .await?;
                }
                let mut params = r.params.clone();
                params.name = original.clone().into();
                let request = ClientRequest::CallToolRequest(CallToolRequest::new(params));
                let params_log = serde_json::to_value(&r.params).ok();
                self.forward(
                    ctx,
                    request,
                    id,
                    "tools/call",
                    LogKind::RequestTool,
                    LogKind::ResponseTool,
                    params_log,
                )
                .await
            }
            ClientRequest::ReadResourceRequest(r) => {
                let prefixed = r.params.uri.clone();
                let (ctx, original, _user) =
                    self.client.resolve(Section::Resources, &prefixed).await?;
                let mut params = r.params.clone();
                params.uri = original;
                let request = ClientRequest::ReadResourceRequest(ReadResourceRequest::new(params));
                let params_log = serde_json::to_value(&r.params).ok();
                self.forward(
                    ctx,
                    request,
                    id,
                    "resources/read",
                    LogKind::RequestResource,
                    LogKind::ResponseResource,
                    params_log,
                )
                .await
            }
            ClientRequest::GetPromptRequest(r) => {
                let prefixed = r.params.name.clone();
                let (ctx, original, _user) =
                    self.client.resolve(Section::Prompts, &prefixed).await?;
                let mut params = r.params.clone();
                params.name = original;
                let request = ClientRequest::GetPromptRequest(GetPromptRequest::new(params));
                let params_log = serde_json::to_value(&r.params).ok();
                self.forward(
                    ctx,
                    request,
                    id,
                    "prompts/get",
                    LogKind::RequestPrompt,
                    LogKind::ResponsePrompt,
                    params_log,
                )
                .await
            }
            ClientRequest::CompleteRequest(r) => {
                let raw = serde_json::to_value(&r.params)
                    .map_err(|e| ErrorData::internal_error(e.to_string(), None))?;
                let (section, prefixed) = completion_target(&raw)?;
                let (ctx, original, _user) = self.client.resolve(section, &prefixed).await?;
                let rewritten = rewrite_completion_target(raw, &original);
                let params: CompleteRequestParam = serde_json::from_value(rewritten)
                    .map_err(|e| ErrorData::invalid_params(e.to_string(), None))?;
                let request = ClientRequest::CompleteRequest(CompleteRequest::new(params));
                self.forward(
                    ctx,
                    request,
                    id,
                    "completion/complete",
                    LogKind::RequestTool,
                    LogKind::ResponseTool,
                    None,
                )
                .await
            }
            ClientRequest::SubscribeRequest(r) => {
                let prefixed = r.params.uri.clone();
                let (ctx, original, _user) =
                    self.client.resolve(Section::Resources, &prefixed).await?;
                self.supervisor
                    .ensure_available(&ctx)
                    .await
                    .map_err(|e| ErrorData::internal_error(e.to_string(), None))?;
                self.supervisor
                    .subscribe_resource(&ctx.instance_id, &original, self.session_id())
                    .await
                    .map_err(|e| ErrorData::internal_error(e.to_string(), None))?;
                Ok(Some(ServerResult::empty(())))
            }
            ClientRequest::UnsubscribeRequest(r) => {
                let prefixed = r.params.uri.clone();
                let (ctx, original, _user) =
                    self.client.resolve(Section::Resources, &prefixed).await?;
                self.supervisor
                    .unsubscribe_resource(&ctx.instance_id, &original, self.session_id())
                    .await
                    .map_err(|e| ErrorData::internal_error(e.to_string(), None))?;
                Ok(Some(ServerResult::empty(())))
            }
            other => {
                debug!(target = "proxy", session = %self.session_id(), "unknown request: {other:?}");
                Err(ErrorData::new(
                    ErrorCode::METHOD_NOT_FOUND,
                    "method not supported",
                    None,
                ))
            }
        }
    }

    async fn handle_notification(&self, notification: ClientNotification) {
        match notification {
            ClientNotification::CancelledNotification(n) => {
                if self.idmap.cancel_by_original(&n.params.request_id).is_none() {
                    debug!(target = "proxy", session = %self.session_id(), "cancel for unknown request");
                }
            }
            ClientNotification::InitializedNotification(_) => {
                debug!(target = "proxy", session = %self.session_id(), "client initialized");
            }
            other => {
                debug!(target = "proxy", session = %self.session_id(), "ignored client notification: {other:?}");
            }
        }
    }

    async fn confirm_tool_call(
        &self,
        ctx: &ServerContext,
        tool: &str,
        arguments: Option<&serde_json::Map<String, JsonValue>>,
    ) -> Result<(), ErrorData> {
        let request = ApprovalRequest {
            approval_id: PendingApprovals::new_request_id(),
            session_id: self.session_id().to_string(),
            user_id: self.client.user_id.clone(),
            server_id: ctx.server_id.clone(),
            tool: tool.to_string(),
            arguments: arguments.map(|m| JsonValue::Object(m.clone())),
        };
        let deadline =
            Duration::from_millis(self.supervisor.settings().approval_timeout_ms);
        let decision =
            tokio::time::timeout(deadline, self.approvals.request_approval(request)).await;
        match decision {
            Ok(ApprovalDecision::Approved) => Ok(()),
            Ok(ApprovalDecision::Denied) | Err(_) => Err(ErrorData::invalid_request(
                "User denied tool execution",
                None,
            )),
        }
    }

    /// Forward a routed request downstream: lazy-start, id mapping with
    /// `proxyContext` metadata, cancellation piggyback, and up to two retries
    /// when the transport could be auto-reconnected.
    #[allow(clippy::too_many_arguments)]
    async fn forward(
        &self,
        ctx: Arc<ServerContext>,
        request: ClientRequest,
        original_id: &RequestId,
        method: &str,
        request_kind: LogKind,
        response_kind: LogKind,
        params_log: Option<JsonValue>,
    ) -> Result<Option<ServerResult>, ErrorData> {
        let started = Instant::now();
        self.supervisor
            .ensure_available(&ctx)
            .await
            .map_err(|e| ErrorData::internal_error(e.to_string(), None))?;

        let entry = self.idmap.register(original_id, &ctx.server_id, method);
        let mut event = LogEvent::new(request_kind)
            .session(self.session_id().to_string())
            .server(ctx.server_id.clone());
        event.upstream_request_id = Some(request_id_string(original_id));
        event.uniform_request_id = Some(entry.uniform_request_id.clone());
        event.params = params_log;
        self.logger.publish(event);

        let mut attempts: u32 = 0;
        let outcome = loop {
            match self.forward_once(&ctx, request.clone(), &entry).await {
                Ok(result) => break Ok(Some(result)),
                Err(ForwardFailure::Cancelled) => break Ok(None),
                Err(ForwardFailure::Downstream(error)) => break Err(error),
                Err(ForwardFailure::Transport(error)) => {
                    let count = ctx.record_error(error.message.to_string());
                    warn!(target = "proxy", session = %self.session_id(), server = %ctx.server_id, errors = count, "forward transport failure: {}", error.message);
                    if attempts < 2 && self.supervisor.try_auto_reconnect(&ctx).await {
                        attempts += 1;
                        continue;
                    }
                    self.supervisor
                        .handle_transport_closed(&ctx, &error.message)
                        .await;
                    break Err(error);
                }
            }
        };
        self.idmap.complete(&entry.proxy_request_id);

        let mut event = LogEvent::new(response_kind)
            .session(self.session_id().to_string())
            .server(ctx.server_id.clone());
        event.upstream_request_id = Some(request_id_string(original_id));
        event.uniform_request_id = Some(entry.uniform_request_id.clone());
        event.duration_ms = Some(started.elapsed().as_millis() as i64);
        match &outcome {
            Ok(Some(result)) => {
                event.result = serde_json::to_value(result).ok();
            }
            Ok(None) => {
                event.error = Some("cancelled".to_string());
            }
            Err(error) => {
                event.error = Some(error.message.to_string());
                event.status_code = Some(error.code.0 as i64);
            }
        }
        self.logger.publish(event);
        outcome
    }

    async fn forward_once(
        &self,
        ctx: &Arc<ServerContext>,
        request: ClientRequest,
        entry: &MappedRequest,
    ) -> Result<ServerResult, ForwardFailure> {
        let service = ctx.connection().await.ok_or_else(|| {
            ForwardFailure::Transport(ErrorData::internal_error(
                format!("server {} not connected", ctx.server_id),
                None,
            ))
        })?;

        let mut meta = Meta::new();
        meta.0.insert(
            "proxyContext".to_string(),
            json!({
                "proxyRequestId": entry.proxy_request_id,
                "uniformRequestId": entry.uniform_request_id,
            }),
        );
        meta.0.insert(
            "progressToken".to_string(),
            json!(entry.proxy_request_id),
        );
        let mut options = PeerRequestOptions::default();
        options.meta = Some(meta);
        options.timeout = Some(Duration::from_secs(
            self.supervisor.settings().request_timeout_secs,
        ));

        let handle = service
            .send_cancellable_request(request, options)
            .await
            .map_err(|e| classify_service_error(e))?;
        let wire_id = handle.id.clone();
        let response = handle.await_response();
        tokio::select! {
            res = response => res.map_err(classify_service_error),
            _ = entry.cancel.cancelled() => {
                let _ = service
                    .send_notification(ClientNotification::CancelledNotification(
                        rmcp::model::CancelledNotification {
                            method: Default::default(),
                            params: CancelledNotificationParam {
                                request_id: wire_id,
                                reason: Some("client cancelled".to_string()),
                            },
                            extensions: Default::default(),
                        },
                    ))
                    .await;
                Err(ForwardFailure::Cancelled)
            }
        }
    }

    // ---------- reverse direction ----------

    pub async fn forward_sampling_to_client(
        &self,
        proxy_request_id: &str,
        params: CreateMessageRequestParam,
    ) -> Result<CreateMessageResult, ErrorData> {
        let value = serde_json::to_value(params)
            .map_err(|e| ErrorData::internal_error(e.to_string(), None))?;
        let raw = self
            .forward_reverse(proxy_request_id, ReverseKind::Sampling, value)
            .await?;
        serde_json::from_value(raw)
            .map_err(|e| ErrorData::internal_error(format!("sampling result: {e}"), None))
    }

    pub async fn forward_roots_list_to_client(
        &self,
        proxy_request_id: &str,
    ) -> Result<ListRootsResult, ErrorData> {
        let raw = self
            .forward_reverse(proxy_request_id, ReverseKind::Roots, json!({}))
            .await?;
        serde_json::from_value(raw)
            .map_err(|e| ErrorData::internal_error(format!("roots result: {e}"), None))
    }

    pub async fn forward_elicitation_to_client(
        &self,
        proxy_request_id: &str,
        params: CreateElicitationRequestParam,
    ) -> Result<CreateElicitationResult, ErrorData> {
        let value = serde_json::to_value(params)
            .map_err(|e| ErrorData::internal_error(e.to_string(), None))?;
        let raw = self
            .forward_reverse(proxy_request_id, ReverseKind::Elicitation, value)
            .await?;
        serde_json::from_value(raw)
            .map_err(|e| ErrorData::internal_error(format!("elicitation result: {e}"), None))
    }

    /// Push a server-initiated request to the client over the session stream
    /// and await its response frame, bounded by the per-kind timeout. The
    /// related client request id is spliced into `_meta` so UIs can associate
    /// the prompt with the call that triggered it.
    async fn forward_reverse(
        &self,
        proxy_request_id: &str,
        kind: ReverseKind,
        mut params: JsonValue,
    ) -> Result<JsonValue, ErrorData> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ErrorData::internal_error("session closed", None));
        }
        if let Some(entry) = self.idmap.get(proxy_request_id) {
            if let Some(obj) = params.as_object_mut() {
                let meta = obj
                    .entry("_meta".to_string())
                    .or_insert_with(|| json!({}));
                if let Some(meta_obj) = meta.as_object_mut() {
                    meta_obj.insert(
                        "relatedRequestId".to_string(),
                        request_id_value(&entry.original),
                    );
                }
            }
        }

        let reverse_id = format!(
            "{}-r{}",
            self.session_id(),
            self.reverse_seq.fetch_add(1, Ordering::Relaxed) + 1
        );
        let (tx, rx) = oneshot::channel();
        self.pending_reverse
            .lock()
            .unwrap()
            .insert(reverse_id.clone(), tx);

        self.push_frame(json!({
            "jsonrpc": "2.0",
            "id": reverse_id,
            "method": kind.method(),
            "params": params,
        }));

        let timeouts = &self.supervisor.settings().reverse_timeouts;
        let deadline = Duration::from_millis(match kind {
            ReverseKind::Sampling => timeouts.sampling_ms,
            ReverseKind::Roots => timeouts.roots_ms,
            ReverseKind::Elicitation => timeouts.elicitation_ms,
        });
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ErrorData::internal_error("session closed", None)),
            Err(_) => {
                self.pending_reverse.lock().unwrap().remove(&reverse_id);
                Err(ErrorData::internal_error(
                    format!("Reverse request timeout: {}", kind.method()),
                    None,
                ))
            }
        }
    }

    fn complete_reverse(&self, id: &RequestId, outcome: Result<JsonValue, ErrorData>) {
        let key = request_id_string(id);
        let sender = self.pending_reverse.lock().unwrap().remove(&key);
        match sender {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => {
                debug!(target = "proxy", session = %self.session_id(), id = %key, "response for unknown reverse request");
            }
        }
    }

    // ---------- notifications to the client ----------

    fn push_frame(&self, frame: JsonValue) -> u64 {
        self.store.append(frame)
    }

    pub async fn notify_list_changed(&self, kind: ListKind) {
        let method = match kind {
            ListKind::Tools => "notifications/tools/list_changed",
            ListKind::Resources => "notifications/resources/list_changed",
            ListKind::Prompts => "notifications/prompts/list_changed",
        };
        self.push_frame(json!({ "jsonrpc": "2.0", "method": method }));
    }

    pub async fn notify_resource_updated(&self, prefixed_uri: &str) {
        self.push_frame(json!({
            "jsonrpc": "2.0",
            "method": "notifications/resources/updated",
            "params": { "uri": prefixed_uri },
        }));
    }

    /// Progress from a downstream, token = proxy request id. Rewritten back
    /// to the client's own request id before delivery.
    pub async fn deliver_progress(&self, params: ProgressNotificationParam) {
        let token = serde_json::to_value(&params.progress_token)
            .ok()
            .and_then(|v| v.as_str().map(|s| s.to_string()));
        let Some(token) = token else {
            return;
        };
        let Some(entry) = self.idmap.get(&token) else {
            debug!(target = "proxy", session = %self.session_id(), "progress for unmapped request");
            return;
        };
        let mut value = serde_json::to_value(&params).unwrap_or(json!({}));
        if let Some(obj) = value.as_object_mut() {
            obj.insert(
                "progressToken".to_string(),
                request_id_value(&entry.original),
            );
        }
        self.push_frame(json!({
            "jsonrpc": "2.0",
            "method": "notifications/progress",
            "params": value,
        }));
    }

    /// Cancellation from a downstream referencing a forwarded request.
    pub async fn deliver_cancelled(&self, params: CancelledNotificationParam) {
        let key = request_id_string(&params.request_id);
        let Some(entry) = self.idmap.get(&key) else {
            return;
        };
        self.push_frame(json!({
            "jsonrpc": "2.0",
            "method": "notifications/cancelled",
            "params": {
                "requestId": request_id_value(&entry.original),
                "reason": params.reason,
            },
        }));
    }

    /// Downstream log message fan-out, filtered by the session's level and
    /// the server's accessibility for this user.
    pub async fn deliver_logging_message(
        &self,
        instance_id: &str,
        params: LoggingMessageNotificationParam,
    ) {
        let Ok((_, contexts)) = self.client.accessible_contexts().await else {
            return;
        };
        if !contexts.iter().any(|c| c.instance_id == instance_id) {
            return;
        }
        let minimum = self.log_level.read().unwrap().clone();
        if let Some(minimum) = minimum {
            if level_rank(&params.level) < level_rank(&minimum) {
                return;
            }
        }
        let value = serde_json::to_value(&params).unwrap_or(json!({}));
        self.push_frame(json!({
            "jsonrpc": "2.0",
            "method": "notifications/message",
            "params": value,
        }));
    }

    fn log_list(&self, kind: LogKind, id: &RequestId, count: usize, started: Instant) {
        let mut event = LogEvent::new(kind).session(self.session_id().to_string());
        event.upstream_request_id = Some(request_id_string(id));
        event.result = Some(json!({ "count": count }));
        event.duration_ms = Some(started.elapsed().as_millis() as i64);
        self.logger.publish(event);
    }

    /// Fail outstanding reverse waiters and stop accepting new ones.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let pending: Vec<oneshot::Sender<Result<JsonValue, ErrorData>>> = {
            let mut guard = self.pending_reverse.lock().unwrap();
            guard.drain().map(|(_, tx)| tx).collect()
        };
        for tx in pending {
            let _ = tx.send(Err(ErrorData::internal_error("session closed", None)));
        }
    }
}

enum ForwardFailure {
    /// The client cancelled; no response frame must be produced.
    Cancelled,
    /// The downstream answered with a protocol error; surface it as-is.
    Downstream(ErrorData),
    /// The transport misbehaved; eligible for the reconnect-and-retry path.
    Transport(ErrorData),
}

fn classify_service_error(error: ServiceError) -> ForwardFailure {
    match error {
        ServiceError::McpError(e) => ForwardFailure::Downstream(e),
        other => ForwardFailure::Transport(ErrorData::internal_error(other.to_string(), None)),
    }
}

fn request_id_value(id: &RequestId) -> JsonValue {
    match id {
        RequestId::Number(n) => json!(n),
        RequestId::String(s) => json!(s.as_ref()),
    }
}

fn response_frame(result: ServerResult, id: &RequestId) -> Option<JsonValue> {
    serde_json::to_value(JsonRpcMessage::<
        rmcp::model::ServerRequest,
        ServerResult,
        rmcp::model::ServerNotification,
    >::response(result, id.clone()))
    .ok()
}

fn error_frame(error: ErrorData, id: &RequestId) -> Option<JsonValue> {
    serde_json::to_value(JsonRpcMessage::<
        rmcp::model::ServerRequest,
        ServerResult,
        rmcp::model::ServerNotification,
    >::error(error, id.clone()))
    .ok()
}

/// Which routed identifier a completion request references.
fn completion_target(params: &JsonValue) -> Result<(Section, String), ErrorData> {
    let reference = params
        .get("ref")
        .ok_or_else(|| ErrorData::invalid_params("completion without ref", None))?;
    if let Some(name) = reference.get("name").and_then(|v| v.as_str()) {
        return Ok((Section::Prompts, name.to_string()));
    }
    if let Some(uri) = reference.get("uri").and_then(|v| v.as_str()) {
        return Ok((Section::Resources, uri.to_string()));
    }
    Err(ErrorData::invalid_params("unsupported completion ref", None))
}

fn rewrite_completion_target(mut params: JsonValue, original: &str) -> JsonValue {
    if let Some(reference) = params.get_mut("ref") {
        if let Some(obj) = reference.as_object_mut() {
            if obj.contains_key("name") {
                obj.insert("name".to_string(), json!(original));
            } else if obj.contains_key("uri") {
                obj.insert("uri".to_string(), json!(original));
            }
        }
    }
    params
}

fn level_rank(level: &LoggingLevel) -> u8 {
    match serde_json::to_value(level)
        .ok()
        .and_then(|v| v.as_str().map(|s| s.to_string()))
        .unwrap_or_default()
        .as_str()
    {
        "debug" => 0,
        "info" => 1,
        "notice" => 2,
        "warning" => 3,
        "error" => 4,
        "critical" => 5,
        "alert" => 6,
        "emergency" => 7,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_target_detection() {
        let prompt_ref = json!({ "ref": { "type": "ref/prompt", "name": "sum_-_1" }, "argument": { "name": "a", "value": "x" } });
        let (section, name) = completion_target(&prompt_ref).unwrap();
        assert_eq!(section, Section::Prompts);
        assert_eq!(name, "sum_-_1");

        let res_ref = json!({ "ref": { "type": "ref/resource", "uri": "file:///a_-_2" }, "argument": { "name": "a", "value": "x" } });
        let (section, uri) = completion_target(&res_ref).unwrap();
        assert_eq!(section, Section::Resources);
        assert_eq!(uri, "file:///a_-_2");

        assert!(completion_target(&json!({})).is_err());
    }

    #[test]
    fn completion_rewrite_strips_suffix() {
        let params = json!({ "ref": { "type": "ref/prompt", "name": "sum_-_1" } });
        let out = rewrite_completion_target(params, "sum");
        assert_eq!(out["ref"]["name"], "sum");
    }

    #[test]
    fn frames_carry_request_ids() {
        let frame = error_frame(
            ErrorData::invalid_params("Permission denied", None),
            &RequestId::Number(4),
        )
        .unwrap();
        assert_eq!(frame["id"], 4);
        assert_eq!(frame["error"]["message"], "Permission denied");
        let _ = frame["error"]["code"].as_i64().unwrap();
    }

    #[test]
    fn logging_levels_are_ordered() {
        // ranks are total-ordered from debug to emergency
        assert!(level_rank(&LoggingLevel::Debug) < level_rank(&LoggingLevel::Error));
        assert!(level_rank(&LoggingLevel::Warning) < level_rank(&LoggingLevel::Emergency));
    }
}
