use std::future::Future;
use std::sync::{Arc, Weak};

use rmcp::{
    model::{
        ClientCapabilities, ClientInfo, ClientResult, ErrorCode, ErrorData, Implementation,
        Meta, ProtocolVersion, ServerNotification, ServerRequest,
    },
    service::{NotificationContext, RequestContext, RoleClient, RunningService},
};
use tracing::{debug, warn};

use crate::router::GlobalRequestRouter;
use crate::supervisor::{ListKind, ServerSupervisor};

pub type DownstreamService = RunningService<RoleClient, ProxyClientHandler>;

/// Client-side handler for one downstream connection. Forward traffic flows
/// through the peer; everything the server initiates lands here and is routed
/// to the owning proxy session via the id prefix carried in `proxyContext`.
#[derive(Clone)]
pub struct ProxyClientHandler {
    pub server_id: String,
    pub instance_id: String,
    router: Arc<GlobalRequestRouter>,
    supervisor: Weak<ServerSupervisor>,
}

impl ProxyClientHandler {
    pub fn new(
        server_id: String,
        instance_id: String,
        router: Arc<GlobalRequestRouter>,
        supervisor: Weak<ServerSupervisor>,
    ) -> Self {
        Self {
            server_id,
            instance_id,
            router,
            supervisor,
        }
    }

    fn route_by_meta(
        &self,
        meta: &Meta,
    ) -> Result<(Arc<crate::proxy::ProxySession>, String), ErrorData> {
        let proxy_request_id = proxy_request_id_from(meta).ok_or_else(|| {
            ErrorData::invalid_request("reverse request without proxyContext", None)
        })?;
        let session = self.router.route(&proxy_request_id).ok_or_else(|| {
            ErrorData::internal_error(
                format!("no session for proxy request {proxy_request_id}"),
                None,
            )
        })?;
        Ok((session, proxy_request_id))
    }

    fn route_by_token(&self, token: &str) -> Option<Arc<crate::proxy::ProxySession>> {
        self.router.route(token)
    }
}

/// `proxyContext.proxyRequestId` travels in `_meta`; parse it loosely at the
/// boundary and stay typed everywhere else.
pub fn proxy_request_id_from(meta: &Meta) -> Option<String> {
    let value = serde_json::to_value(meta).ok()?;
    value
        .get("proxyContext")?
        .get("proxyRequestId")?
        .as_str()
        .map(|s| s.to_string())
}

impl rmcp::service::Service<RoleClient> for ProxyClientHandler {
    fn handle_request(
        &self,
        request: ServerRequest,
        context: RequestContext<RoleClient>,
    ) -> impl Future<Output = Result<ClientResult, ErrorData>> + Send {
        let this = self.clone();
        async move {
            match request {
                ServerRequest::PingRequest(_) => Ok(ClientResult::empty(())),
                ServerRequest::CreateMessageRequest(r) => {
                    let (session, proxy_request_id) = this.route_by_meta(&context.meta)?;
                    let result = session
                        .forward_sampling_to_client(&proxy_request_id, r.params)
                        .await?;
                    Ok(ClientResult::CreateMessageResult(Box::new(result)))
                }
                ServerRequest::ListRootsRequest(_) => {
                    let (session, proxy_request_id) = this.route_by_meta(&context.meta)?;
                    let result = session
                        .forward_roots_list_to_client(&proxy_request_id)
                        .await?;
                    Ok(ClientResult::ListRootsResult(result))
                }
                ServerRequest::CreateElicitationRequest(r) => {
                    let (session, proxy_request_id) = this.route_by_meta(&context.meta)?;
                    let result = session
                        .forward_elicitation_to_client(&proxy_request_id, r.params)
                        .await?;
                    Ok(ClientResult::CreateElicitationResult(result))
                }
                other => {
                    debug!(target = "handler", server = %this.server_id, "unsupported reverse request: {other:?}");
                    Err(ErrorData::new(
                        ErrorCode::METHOD_NOT_FOUND,
                        "unsupported server-initiated request",
                        None,
                    ))
                }
            }
        }
    }

    fn handle_notification(
        &self,
        notification: ServerNotification,
        _context: NotificationContext<RoleClient>,
    ) -> impl Future<Output = Result<(), ErrorData>> + Send {
        let this = self.clone();
        async move {
            match notification {
                ServerNotification::ProgressNotification(n) => {
                    let token = serde_json::to_value(&n.params.progress_token)
                        .ok()
                        .and_then(|v| v.as_str().map(|s| s.to_string()));
                    match token.as_deref().and_then(|t| this.route_by_token(t)) {
                        Some(session) => session.deliver_progress(n.params).await,
                        None => {
                            debug!(target = "handler", server = %this.server_id, "progress without routable token")
                        }
                    }
                }
                ServerNotification::CancelledNotification(n) => {
                    let id = request_id_string(&n.params.request_id);
                    match this.route_by_token(&id) {
                        Some(session) => session.deliver_cancelled(n.params).await,
                        None => {
                            debug!(target = "handler", server = %this.server_id, request_id = %id, "cancellation without routable id")
                        }
                    }
                }
                ServerNotification::ResourceUpdatedNotification(n) => {
                    if let Some(supervisor) = this.supervisor.upgrade() {
                        supervisor
                            .on_resource_updated(&this.instance_id, &n.params.uri)
                            .await;
                    }
                }
                ServerNotification::ToolListChangedNotification(_) => {
                    this.relist(ListKind::Tools).await;
                }
                ServerNotification::ResourceListChangedNotification(_) => {
                    this.relist(ListKind::Resources).await;
                }
                ServerNotification::PromptListChangedNotification(_) => {
                    this.relist(ListKind::Prompts).await;
                }
                ServerNotification::LoggingMessageNotification(n) => {
                    for session in this.router.all() {
                        session
                            .deliver_logging_message(&this.instance_id, n.params.clone())
                            .await;
                    }
                }
                other => {
                    debug!(target = "handler", server = %this.server_id, "ignored notification: {other:?}");
                }
            }
            Ok(())
        }
    }

    fn get_info(&self) -> ClientInfo {
        ClientInfo {
            protocol_version: ProtocolVersion::default(),
            capabilities: ClientCapabilities::builder()
                .enable_sampling()
                .enable_roots()
                .enable_elicitation()
                .build(),
            client_info: Implementation {
                name: "mcp-switchboard".into(),
                title: Some("MCP Switchboard".into()),
                version: env!("CARGO_PKG_VERSION").into(),
                icons: None,
                website_url: None,
            },
        }
    }
}

impl ProxyClientHandler {
    async fn relist(&self, kind: ListKind) {
        let Some(supervisor) = self.supervisor.upgrade() else {
            warn!(target = "handler", server = %self.server_id, "list change after supervisor shutdown");
            return;
        };
        supervisor.handle_list_changed(&self.instance_id, kind).await;
    }
}

pub fn request_id_string(id: &rmcp::model::RequestId) -> String {
    match id {
        rmcp::model::RequestId::String(s) => s.to_string(),
        rmcp::model::RequestId::Number(n) => n.to_string(),
    }
}
