//! MCP server implementation
//!
//! The server is the capability-provider side of a connection: it answers
//! the initialization handshake with version negotiation, normalizes the
//! client's declared capabilities, filters outbound log messages per
//! session, drives elicitation (form and URL modes), and resolves prompt
//! argument completions through the completable registry.

use std::sync::{Arc, RwLock as StdRwLock};

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::capabilities::{
    assert_client_capability, assert_server_notification_capability,
    assert_server_request_handler_capability, normalize_client_capabilities,
    supports_form_elicitation, supports_url_elicitation,
};
use crate::completion::{completion_result, empty_completion, Completable, CompletableRegistry};
use crate::protocol::{
    methods, CompleteParams, CompletionReference, CreateMessageParams, CreateMessageResult,
    ClientCapabilities, ClientInfo, ElicitParams, ElicitResult, ElicitationAction,
    ElicitationMode, InitializeParams, InitializeResult, ListRootsResult, LoggingLevel,
    LoggingMessageParams, RequestId, ResourceUpdatedParams, ServerCapabilities, ServerInfo,
    SetLevelParams, LATEST_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};
use crate::session::{
    parse_params, ConnectionState, NotificationOptions, RequestContext, RequestOptions, Session,
    SessionOptions,
};
use crate::transport::Transport;
use crate::validator::{JsonSchemaValidator, SchemaValidator};
use crate::{Error, Result};

/// Server configuration
#[derive(Default)]
pub struct ServerOptions {
    pub session: SessionOptions,
    /// Usage instructions advertised in the handshake result
    pub instructions: Option<String>,
}

/// An in-progress elicitation, tracked until its out-of-band completion
#[derive(Debug, Clone)]
pub struct ElicitationRecord {
    pub elicitation_id: String,
    pub mode: ElicitationMode,
    pub related_request_id: Option<RequestId>,
}

struct ServerInner {
    session: Session,
    server_info: ServerInfo,
    capabilities: ServerCapabilities,
    instructions: Option<String>,
    client_capabilities: StdRwLock<Option<ClientCapabilities>>,
    client_info: StdRwLock<Option<ClientInfo>>,
    log_levels: DashMap<String, LoggingLevel>,
    completions: CompletableRegistry,
    elicitations: DashMap<String, ElicitationRecord>,
    validator: Arc<dyn SchemaValidator>,
}

/// MCP server endpoint for a single connection
#[derive(Clone)]
pub struct McpServer {
    inner: Arc<ServerInner>,
}

impl McpServer {
    /// Create a new MCP server with the given identity and capabilities
    pub fn new(server_info: ServerInfo, capabilities: ServerCapabilities) -> Self {
        Self::with_options(server_info, capabilities, ServerOptions::default())
    }

    /// Create a new MCP server with engine options
    pub fn with_options(
        server_info: ServerInfo,
        capabilities: ServerCapabilities,
        options: ServerOptions,
    ) -> Self {
        let session = Session::new(options.session);
        let server = Self {
            inner: Arc::new(ServerInner {
                session,
                server_info,
                capabilities,
                instructions: options.instructions,
                client_capabilities: StdRwLock::new(None),
                client_info: StdRwLock::new(None),
                log_levels: DashMap::new(),
                completions: CompletableRegistry::new(),
                elicitations: DashMap::new(),
                validator: Arc::new(JsonSchemaValidator::new()),
            }),
        };
        server.install_builtin_handlers();
        server
    }

    fn install_builtin_handlers(&self) {
        let session = &self.inner.session;

        // The handshake and ping work before the connection is Ready, and
        // regardless of declared capabilities.
        let inner = self.inner.clone();
        session.set_request_handler(methods::INITIALIZE, move |params, _ctx| {
            let inner = inner.clone();
            Box::pin(async move { inner.handle_initialize(params) })
        });

        session.set_request_handler(methods::PING, |_params, _ctx| {
            Box::pin(async { Ok(json!({})) })
        });

        let inner = self.inner.clone();
        session.set_notification_handler(methods::NOTIFICATION_INITIALIZED, move |_params| {
            let inner = inner.clone();
            Box::pin(async move {
                debug!("Client completed initialization");
                inner.session.set_state(ConnectionState::Ready);
                Ok(())
            })
        });

        if self.inner.capabilities.logging.is_some() {
            let inner = self.inner.clone();
            session.set_request_handler(methods::SET_LOGGING_LEVEL, move |params, ctx| {
                let inner = inner.clone();
                Box::pin(async move {
                    let params: SetLevelParams = parse_params(params)?;
                    let key = ctx
                        .session_id
                        .unwrap_or_else(|| "default".to_string());
                    debug!(session = %key, level = ?params.level, "Logging level set");
                    inner.log_levels.insert(key, params.level);
                    Ok(json!({}))
                })
            });
        }

        if self.inner.capabilities.completions.is_some() {
            let inner = self.inner.clone();
            session.set_request_handler(methods::COMPLETE, move |params, _ctx| {
                let inner = inner.clone();
                Box::pin(async move {
                    let params: CompleteParams = parse_params(params)?;
                    let result = match &params.reference {
                        CompletionReference::Prompt { name } => {
                            match inner.completions.get_completer(name, &params.argument.name) {
                                Some(completer) => {
                                    let values =
                                        completer(params.argument.value, params.context).await?;
                                    completion_result(values)
                                }
                                None => empty_completion(),
                            }
                        }
                        CompletionReference::Resource { .. } => empty_completion(),
                    };
                    Ok(serde_json::to_value(result)?)
                })
            });
        }
    }

    /// Attach the transport and start serving. The client drives the
    /// handshake; a sessioned transport resumes straight into Ready.
    pub async fn connect(&self, transport: Box<dyn Transport>) -> Result<()> {
        self.inner.session.connect(transport).await?;
        let state = if self.inner.session.transport_session_id().is_some() {
            ConnectionState::Ready
        } else {
            ConnectionState::Connecting
        };
        self.inner.session.set_state(state);
        Ok(())
    }

    /// Close the connection
    pub async fn close(&self) {
        self.inner.session.close().await;
    }

    /// The underlying protocol session
    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    /// Capabilities this server declared
    pub fn capabilities(&self) -> &ServerCapabilities {
        &self.inner.capabilities
    }

    /// Capabilities the client declared, normalized
    pub fn client_capabilities(&self) -> Option<ClientCapabilities> {
        self.inner.client_capabilities.read().unwrap().clone()
    }

    /// Client identity from the handshake
    pub fn client_info(&self) -> Option<ClientInfo> {
        self.inner.client_info.read().unwrap().clone()
    }

    /// Register a raw request handler, subject to the strict capability gate
    pub fn set_request_handler(
        &self,
        method: &str,
        handler: impl Fn(Option<Value>, RequestContext) -> BoxFuture<'static, Result<Value>>
            + Send
            + Sync
            + 'static,
    ) -> Result<()> {
        if self.inner.session.options().enforce_strict_capabilities {
            assert_server_request_handler_capability(&self.inner.capabilities, method)?;
        }
        self.inner.session.set_request_handler(method, handler);
        Ok(())
    }

    /// Register a raw notification handler
    pub fn set_notification_handler(
        &self,
        method: &str,
        handler: impl Fn(Option<Value>) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    ) {
        self.inner.session.set_notification_handler(method, handler);
    }

    /// Attach a completer to a prompt argument slot
    pub fn register_completion(&self, prompt: &str, argument: &str, completable: Completable) {
        self.inner.completions.register(prompt, argument, completable);
    }

    /// Whether a prompt argument slot has a completer attached
    pub fn is_completable(&self, prompt: &str, argument: &str) -> bool {
        self.inner.completions.is_completable(prompt, argument)
    }

    fn client_capabilities_or_default(&self) -> ClientCapabilities {
        self.inner
            .client_capabilities
            .read()
            .unwrap()
            .clone()
            .unwrap_or_default()
    }

    /// Check connection health
    pub async fn ping(&self) -> Result<()> {
        let _ = self
            .inner
            .session
            .request(methods::PING, None, RequestOptions::default())
            .await?;
        Ok(())
    }

    /// Ask the client to sample a model response. Requires the client to
    /// have declared sampling.
    pub async fn create_message(
        &self,
        params: CreateMessageParams,
        options: RequestOptions,
    ) -> Result<CreateMessageResult> {
        assert_client_capability(&self.client_capabilities_or_default(), methods::CREATE_MESSAGE)?;
        let value = self
            .inner
            .session
            .request(
                methods::CREATE_MESSAGE,
                Some(serde_json::to_value(&params)?),
                options,
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// List the client's roots. Requires the client to have declared roots.
    pub async fn list_roots(&self, options: RequestOptions) -> Result<ListRootsResult> {
        assert_client_capability(&self.client_capabilities_or_default(), methods::LIST_ROOTS)?;
        let value = self
            .inner
            .session
            .request(methods::LIST_ROOTS, None, options)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// A fresh elicitation id for URL-mode round trips
    pub fn new_elicitation_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Ask the user, via the client, for structured input.
    ///
    /// Mode defaults to form. Form-mode accepted content is validated
    /// against the requested schema with the configured validator; decline
    /// and cancel results pass through untouched. URL mode sends the user to
    /// `params.url`; the final content typically arrives later through an
    /// out-of-band completion notification.
    pub async fn elicit_input(
        &self,
        mut params: ElicitParams,
        options: RequestOptions,
    ) -> Result<ElicitResult> {
        let mode = params.mode.unwrap_or(ElicitationMode::Form);
        let capabilities = self.client_capabilities_or_default();
        let elicitation = capabilities.elicitation.as_ref();

        match mode {
            ElicitationMode::Form => {
                if !supports_form_elicitation(elicitation) {
                    return Err(Error::Capability(
                        "Client does not support form elicitation.".to_string(),
                    ));
                }
                // Omitted on the wire for compatibility with pre-url clients.
                params.mode = None;
            }
            ElicitationMode::Url => {
                if !supports_url_elicitation(elicitation) {
                    return Err(Error::Capability(
                        "Client does not support url elicitation.".to_string(),
                    ));
                }
                if params.url.is_none() {
                    return Err(Error::invalid_params(
                        "URL-mode elicitation requires a url",
                    ));
                }
                let elicitation_id = params
                    .elicitation_id
                    .get_or_insert_with(Self::new_elicitation_id)
                    .clone();
                params.mode = Some(ElicitationMode::Url);
                self.inner.elicitations.insert(
                    elicitation_id.clone(),
                    ElicitationRecord {
                        elicitation_id,
                        mode,
                        related_request_id: options.related_request_id.clone(),
                    },
                );
            }
        }

        let requested_schema = params.requested_schema.clone();
        let value = self
            .inner
            .session
            .request(
                methods::ELICITATION_CREATE,
                Some(serde_json::to_value(&params)?),
                options,
            )
            .await?;
        let result: ElicitResult = serde_json::from_value(value)?;

        if mode == ElicitationMode::Form && result.action == ElicitationAction::Accept {
            if let Some(schema) = requested_schema {
                let compiled = self.inner.validator.get_validator(&schema).map_err(|e| {
                    Error::Internal(anyhow::anyhow!(
                        "Error validating elicitation response: {}",
                        e
                    ))
                })?;
                let content = result.content.clone().unwrap_or_else(|| json!({}));
                compiled.validate(&content).map_err(|message| {
                    Error::invalid_params(format!(
                        "Elicitation response content does not match requested schema: {}",
                        message
                    ))
                })?;
            }
        }

        Ok(result)
    }

    /// Build an async closure that marks a URL-mode elicitation complete by
    /// emitting `notifications/elicitation/complete`. Fails unless the
    /// client declared url elicitation.
    pub fn create_elicitation_completion_notifier(
        &self,
        elicitation_id: impl Into<String>,
        options: NotificationOptions,
    ) -> Result<impl Fn() -> BoxFuture<'static, Result<()>> + Send + Sync> {
        let capabilities = self.client_capabilities_or_default();
        if !supports_url_elicitation(capabilities.elicitation.as_ref()) {
            return Err(Error::Capability(
                "Client does not support url elicitation.".to_string(),
            ));
        }

        let elicitation_id = elicitation_id.into();
        let inner = self.inner.clone();
        Ok(move || {
            let inner = inner.clone();
            let elicitation_id = elicitation_id.clone();
            let options = options.clone();
            Box::pin(async move {
                inner.elicitations.remove(&elicitation_id);
                inner
                    .session
                    .notification(
                        methods::NOTIFICATION_ELICITATION_COMPLETE,
                        Some(json!({ "elicitationId": elicitation_id })),
                        options,
                    )
                    .await
            }) as BoxFuture<'static, Result<()>>
        })
    }

    /// Elicitations awaiting out-of-band completion
    pub fn pending_elicitations(&self) -> Vec<ElicitationRecord> {
        self.inner
            .elicitations
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Send a log message to the client, honoring the per-session minimum
    /// severity. The minimum defaults to info until the client calls
    /// `logging/setLevel`. `session_key` overrides the transport session id
    /// for servers multiplexing several conversations.
    pub async fn send_logging_message(
        &self,
        params: LoggingMessageParams,
        session_key: Option<&str>,
    ) -> Result<()> {
        assert_server_notification_capability(
            &self.inner.capabilities,
            methods::NOTIFICATION_MESSAGE,
        )?;

        let key = session_key
            .map(str::to_string)
            .or_else(|| self.inner.session.transport_session_id())
            .unwrap_or_else(|| "default".to_string());
        let minimum = self
            .inner
            .log_levels
            .get(&key)
            .map(|entry| *entry.value())
            .unwrap_or(LoggingLevel::Info);

        if params.level < minimum {
            debug!(level = ?params.level, minimum = ?minimum, "Suppressed log message");
            return Ok(());
        }

        self.inner
            .session
            .notification(
                methods::NOTIFICATION_MESSAGE,
                Some(serde_json::to_value(&params)?),
                NotificationOptions::default(),
            )
            .await
    }

    /// Notify the client that a subscribed resource changed
    pub async fn send_resource_updated(&self, uri: impl Into<String>) -> Result<()> {
        assert_server_notification_capability(
            &self.inner.capabilities,
            methods::NOTIFICATION_RESOURCE_UPDATED,
        )?;
        let params = ResourceUpdatedParams { uri: uri.into() };
        self.inner
            .session
            .notification(
                methods::NOTIFICATION_RESOURCE_UPDATED,
                Some(serde_json::to_value(&params)?),
                NotificationOptions::default(),
            )
            .await
    }

    /// Notify the client that the resource list changed
    pub async fn send_resource_list_changed(&self) -> Result<()> {
        self.send_list_changed(methods::NOTIFICATION_RESOURCE_LIST_CHANGED)
            .await
    }

    /// Notify the client that the tool list changed
    pub async fn send_tool_list_changed(&self) -> Result<()> {
        self.send_list_changed(methods::NOTIFICATION_TOOL_LIST_CHANGED)
            .await
    }

    /// Notify the client that the prompt list changed
    pub async fn send_prompt_list_changed(&self) -> Result<()> {
        self.send_list_changed(methods::NOTIFICATION_PROMPT_LIST_CHANGED)
            .await
    }

    async fn send_list_changed(&self, method: &str) -> Result<()> {
        assert_server_notification_capability(&self.inner.capabilities, method)?;
        self.inner
            .session
            .notification(method, None, NotificationOptions::default())
            .await
    }
}

impl ServerInner {
    fn handle_initialize(&self, params: Option<Value>) -> Result<Value> {
        let params: InitializeParams = parse_params(params)?;

        // Echo a supported requested version; otherwise answer with the
        // newest this server speaks and let the client decide.
        let requested = params.protocol_version;
        let version = if SUPPORTED_PROTOCOL_VERSIONS.contains(&requested.as_str()) {
            requested
        } else {
            LATEST_PROTOCOL_VERSION.to_string()
        };

        info!(
            client = %params.client_info.name,
            client_version = %params.client_info.version,
            protocol = %version,
            "Client initializing"
        );

        let capabilities = normalize_client_capabilities(params.capabilities);
        *self.client_capabilities.write().unwrap() = Some(capabilities);
        *self.client_info.write().unwrap() = Some(params.client_info);
        self.session.set_state(ConnectionState::Initializing);

        let result = InitializeResult {
            protocol_version: version,
            capabilities: self.capabilities.clone(),
            server_info: self.server_info.clone(),
            instructions: self.instructions.clone(),
        };
        Ok(serde_json::to_value(result)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PromptsCapability, ResourcesCapability};
    use serde_json::json;

    fn test_server(capabilities: ServerCapabilities, strict: bool) -> McpServer {
        McpServer::with_options(
            ServerInfo {
                name: "test-server".to_string(),
                version: "1.0.0".to_string(),
                title: None,
            },
            capabilities,
            ServerOptions {
                session: SessionOptions {
                    enforce_strict_capabilities: strict,
                    ..Default::default()
                },
                instructions: None,
            },
        )
    }

    #[test]
    fn test_registration_gate_rejects_undeclared_tools() {
        let server = test_server(
            ServerCapabilities {
                prompts: Some(PromptsCapability::default()),
                resources: Some(ResourcesCapability::default()),
                ..Default::default()
            },
            true,
        );

        let err = server
            .set_request_handler(methods::LIST_TOOLS, |_params, _ctx| {
                Box::pin(async { Ok(json!({"tools": []})) })
            })
            .unwrap_err();
        assert_eq!(err.to_string(), "Server does not support tools");
    }

    #[test]
    fn test_registration_allowed_without_strict_mode() {
        let server = test_server(ServerCapabilities::default(), false);
        assert!(server
            .set_request_handler(methods::LIST_TOOLS, |_params, _ctx| {
                Box::pin(async { Ok(json!({"tools": []})) })
            })
            .is_ok());
    }

    #[test]
    fn test_initialize_echoes_supported_version() {
        let server = test_server(ServerCapabilities::default(), false);
        let value = server
            .inner
            .handle_initialize(Some(json!({
                "protocolVersion": SUPPORTED_PROTOCOL_VERSIONS[1],
                "capabilities": {},
                "clientInfo": {"name": "c", "version": "1.0"}
            })))
            .unwrap();
        assert_eq!(value["protocolVersion"], SUPPORTED_PROTOCOL_VERSIONS[1]);
    }

    #[test]
    fn test_initialize_answers_latest_for_unknown_version() {
        let server = test_server(ServerCapabilities::default(), false);
        let value = server
            .inner
            .handle_initialize(Some(json!({
                "protocolVersion": "1999-01-01",
                "capabilities": {},
                "clientInfo": {"name": "c", "version": "1.0"}
            })))
            .unwrap();
        assert_eq!(value["protocolVersion"], LATEST_PROTOCOL_VERSION);
    }

    #[test]
    fn test_initialize_normalizes_client_capabilities() {
        let server = test_server(ServerCapabilities::default(), false);
        server
            .inner
            .handle_initialize(Some(json!({
                "protocolVersion": LATEST_PROTOCOL_VERSION,
                "capabilities": {"elicitation": {}},
                "clientInfo": {"name": "c", "version": "1.0"}
            })))
            .unwrap();

        let capabilities = server.client_capabilities().unwrap();
        assert!(supports_form_elicitation(capabilities.elicitation.as_ref()));
    }

    #[tokio::test]
    async fn test_elicit_input_requires_declared_mode() {
        let server = test_server(ServerCapabilities::default(), false);
        *server.inner.client_capabilities.write().unwrap() =
            Some(ClientCapabilities::default());

        let err = server
            .elicit_input(
                ElicitParams {
                    mode: None,
                    message: "your name?".to_string(),
                    requested_schema: None,
                    elicitation_id: None,
                    url: None,
                },
                RequestOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Client does not support form elicitation.");

        let err = server
            .elicit_input(
                ElicitParams {
                    mode: Some(ElicitationMode::Url),
                    message: "visit".to_string(),
                    requested_schema: None,
                    elicitation_id: None,
                    url: Some("https://example.com/auth".to_string()),
                },
                RequestOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Client does not support url elicitation.");
    }

    #[test]
    fn test_completion_notifier_requires_url_capability() {
        let server = test_server(ServerCapabilities::default(), false);
        *server.inner.client_capabilities.write().unwrap() =
            Some(ClientCapabilities::default());

        let err = server
            .create_elicitation_completion_notifier("elicit-1", NotificationOptions::default())
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "Client does not support url elicitation.");
    }
}
