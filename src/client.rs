//! MCP client implementation
//!
//! The client is the host side of a connection: it drives the
//! initialization handshake, wraps every server-addressed method with the
//! capability gate, enforces server-declared tool output schemas, and
//! guards inbound elicitation requests against the modes it declared.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::capabilities::{
    applies_form_defaults, assert_client_notification_capability,
    assert_client_request_handler_capability, assert_server_capability,
    normalize_client_capabilities, supports_form_elicitation, supports_url_elicitation,
};
use crate::elicitation::apply_defaults_to_content;
use crate::protocol::{
    error_codes, methods, CallToolParams, CallToolResult, ClientCapabilities, ClientInfo,
    CompleteParams, CompleteResult, CreateMessageParams, CreateMessageResult, ElicitParams,
    ElicitResult, ElicitationAction, ElicitationMode, GetPromptParams, GetPromptResult,
    InitializeParams, InitializeResult, ListPromptsParams, ListPromptsResult,
    ListResourceTemplatesParams, ListResourceTemplatesResult, ListResourcesParams,
    ListResourcesResult, ListRootsResult, ListToolsParams, ListToolsResult, LoggingLevel,
    ReadResourceResult, ResourceParams, ServerCapabilities, ServerInfo, SetLevelParams,
    LATEST_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};
use crate::session::{
    parse_params, ConnectionState, NotificationOptions, RequestContext, RequestOptions, Session,
    SessionOptions,
};
use crate::transport::Transport;
use crate::validator::{CompiledSchema, JsonSchemaValidator, SchemaValidator};
use crate::{Error, Result};

/// Client configuration
#[derive(Default)]
pub struct ClientOptions {
    pub session: SessionOptions,
}

/// MCP client for connecting to MCP servers
pub struct McpClient {
    session: Session,
    client_info: ClientInfo,
    capabilities: ClientCapabilities,
    validator: Arc<dyn SchemaValidator>,
    server_capabilities: StdRwLock<Option<ServerCapabilities>>,
    server_info: StdRwLock<Option<ServerInfo>>,
    instructions: StdRwLock<Option<String>>,
    protocol_version: StdRwLock<Option<String>>,
    output_validators: StdMutex<HashMap<String, Arc<dyn CompiledSchema>>>,
}

impl McpClient {
    /// Create a new MCP client. The declared capabilities go through the
    /// same normalization the server applies on receipt, so both sides see
    /// one truth.
    pub fn new(client_info: ClientInfo, capabilities: ClientCapabilities) -> Self {
        Self::with_options(client_info, capabilities, ClientOptions::default())
    }

    /// Create a new MCP client with engine options
    pub fn with_options(
        client_info: ClientInfo,
        capabilities: ClientCapabilities,
        options: ClientOptions,
    ) -> Self {
        let session = Session::new(options.session);

        // ping must be answerable regardless of declared capabilities.
        session.set_request_handler(methods::PING, |_params, _ctx| {
            Box::pin(async { Ok(json!({})) })
        });

        Self {
            session,
            client_info,
            capabilities: normalize_client_capabilities(capabilities),
            validator: Arc::new(JsonSchemaValidator::new()),
            server_capabilities: StdRwLock::new(None),
            server_info: StdRwLock::new(None),
            instructions: StdRwLock::new(None),
            protocol_version: StdRwLock::new(None),
            output_validators: StdMutex::new(HashMap::new()),
        }
    }

    /// Replace the schema validator used for tool output enforcement
    pub fn set_validator(&mut self, validator: Arc<dyn SchemaValidator>) {
        self.validator = validator;
    }

    /// The underlying protocol session
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Capabilities declared by this client (after normalization)
    pub fn capabilities(&self) -> &ClientCapabilities {
        &self.capabilities
    }

    /// Capabilities the server declared during the handshake
    pub fn server_capabilities(&self) -> Option<ServerCapabilities> {
        self.server_capabilities.read().unwrap().clone()
    }

    /// Server identity from the handshake
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.server_info.read().unwrap().clone()
    }

    /// Usage instructions the server supplied, if any
    pub fn instructions(&self) -> Option<String> {
        self.instructions.read().unwrap().clone()
    }

    /// The negotiated protocol version
    pub fn protocol_version(&self) -> Option<String> {
        self.protocol_version.read().unwrap().clone()
    }

    /// Connect over `transport` and run the initialization handshake.
    ///
    /// When the transport carries a session id the conversation is resumed:
    /// the handshake is skipped and previously negotiated state is presumed
    /// to hold. Caches are deliberately kept.
    pub async fn connect(&self, transport: Box<dyn Transport>) -> Result<()> {
        self.session.connect(transport).await?;

        if let Some(session_id) = self.session.transport_session_id() {
            debug!(session_id = %session_id, "Resuming session, skipping handshake");
            self.session.set_state(ConnectionState::Ready);
            return Ok(());
        }

        self.session.set_state(ConnectionState::Initializing);
        match self.initialize().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.session.close().await;
                Err(e)
            }
        }
    }

    async fn initialize(&self) -> Result<()> {
        let params = InitializeParams {
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            capabilities: self.capabilities.clone(),
            client_info: self.client_info.clone(),
        };

        let value = self
            .session
            .request(
                methods::INITIALIZE,
                Some(serde_json::to_value(&params)?),
                RequestOptions::default(),
            )
            .await?;
        let result: InitializeResult = serde_json::from_value(value)?;

        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&result.protocol_version.as_str()) {
            return Err(Error::protocol(
                error_codes::INVALID_REQUEST,
                format!(
                    "Server's protocol version is not supported: {}",
                    result.protocol_version
                ),
            ));
        }

        info!(
            server = %result.server_info.name,
            version = %result.server_info.version,
            protocol = %result.protocol_version,
            "MCP client initialized"
        );

        self.session.set_protocol_version(&result.protocol_version);
        *self.server_capabilities.write().unwrap() = Some(result.capabilities);
        *self.server_info.write().unwrap() = Some(result.server_info);
        *self.instructions.write().unwrap() = result.instructions;
        *self.protocol_version.write().unwrap() = Some(result.protocol_version);

        self.session
            .notification(
                methods::NOTIFICATION_INITIALIZED,
                None,
                NotificationOptions::default(),
            )
            .await?;
        self.session.set_state(ConnectionState::Ready);
        Ok(())
    }

    /// Close the connection
    pub async fn close(&self) {
        self.session.close().await;
    }

    /// Gated request plumbing shared by the typed wrappers
    async fn server_request<R: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
        options: RequestOptions,
    ) -> Result<R> {
        let capabilities = self
            .server_capabilities
            .read()
            .unwrap()
            .clone()
            .unwrap_or_default();
        assert_server_capability(&capabilities, method)?;

        let value = self.session.request(method, params, options).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Check connection health
    pub async fn ping(&self) -> Result<()> {
        let _: Value = self
            .server_request(methods::PING, None, RequestOptions::default())
            .await?;
        Ok(())
    }

    /// Ask the server to complete an argument value
    pub async fn complete(
        &self,
        params: CompleteParams,
        options: RequestOptions,
    ) -> Result<CompleteResult> {
        self.server_request(
            methods::COMPLETE,
            Some(serde_json::to_value(&params)?),
            options,
        )
        .await
    }

    /// Set the minimum severity the server should send log messages at
    pub async fn set_logging_level(&self, level: LoggingLevel) -> Result<()> {
        let params = SetLevelParams { level };
        let _: Value = self
            .server_request(
                methods::SET_LOGGING_LEVEL,
                Some(serde_json::to_value(&params)?),
                RequestOptions::default(),
            )
            .await?;
        Ok(())
    }

    pub async fn get_prompt(
        &self,
        params: GetPromptParams,
        options: RequestOptions,
    ) -> Result<GetPromptResult> {
        self.server_request(
            methods::GET_PROMPT,
            Some(serde_json::to_value(&params)?),
            options,
        )
        .await
    }

    pub async fn list_prompts(
        &self,
        params: Option<ListPromptsParams>,
    ) -> Result<ListPromptsResult> {
        self.server_request(
            methods::LIST_PROMPTS,
            params.map(|p| serde_json::to_value(&p)).transpose()?,
            RequestOptions::default(),
        )
        .await
    }

    pub async fn list_resources(
        &self,
        params: Option<ListResourcesParams>,
    ) -> Result<ListResourcesResult> {
        self.server_request(
            methods::LIST_RESOURCES,
            params.map(|p| serde_json::to_value(&p)).transpose()?,
            RequestOptions::default(),
        )
        .await
    }

    pub async fn list_resource_templates(
        &self,
        params: Option<ListResourceTemplatesParams>,
    ) -> Result<ListResourceTemplatesResult> {
        self.server_request(
            methods::LIST_RESOURCE_TEMPLATES,
            params.map(|p| serde_json::to_value(&p)).transpose()?,
            RequestOptions::default(),
        )
        .await
    }

    pub async fn read_resource(&self, uri: impl Into<String>) -> Result<ReadResourceResult> {
        let params = ResourceParams { uri: uri.into() };
        self.server_request(
            methods::READ_RESOURCE,
            Some(serde_json::to_value(&params)?),
            RequestOptions::default(),
        )
        .await
    }

    pub async fn subscribe_resource(&self, uri: impl Into<String>) -> Result<()> {
        let params = ResourceParams { uri: uri.into() };
        let _: Value = self
            .server_request(
                methods::SUBSCRIBE_RESOURCE,
                Some(serde_json::to_value(&params)?),
                RequestOptions::default(),
            )
            .await?;
        Ok(())
    }

    pub async fn unsubscribe_resource(&self, uri: impl Into<String>) -> Result<()> {
        let params = ResourceParams { uri: uri.into() };
        let _: Value = self
            .server_request(
                methods::UNSUBSCRIBE_RESOURCE,
                Some(serde_json::to_value(&params)?),
                RequestOptions::default(),
            )
            .await?;
        Ok(())
    }

    /// List the server's tools and refresh the output-schema validator
    /// cache. After this returns, the cache holds a compiled validator for
    /// exactly the tools in the response that declare an output schema.
    pub async fn list_tools(&self, params: Option<ListToolsParams>) -> Result<ListToolsResult> {
        let result: ListToolsResult = self
            .server_request(
                methods::LIST_TOOLS,
                params.map(|p| serde_json::to_value(&p)).transpose()?,
                RequestOptions::default(),
            )
            .await?;

        let mut compiled = Vec::new();
        for tool in &result.tools {
            if let Some(schema) = &tool.output_schema {
                compiled.push((tool.name.clone(), self.validator.get_validator(schema)?));
            }
        }

        // Clear-then-fill under one lock so concurrent callers never see a
        // partially refreshed cache.
        let mut cache = self.output_validators.lock().unwrap();
        cache.clear();
        cache.extend(compiled);

        Ok(result)
    }

    /// Invoke a tool, enforcing its cached output schema: a non-error result
    /// must carry structured content and that content must validate.
    pub async fn call_tool(
        &self,
        params: CallToolParams,
        options: RequestOptions,
    ) -> Result<CallToolResult> {
        let name = params.name.clone();
        let result: CallToolResult = self
            .server_request(
                methods::CALL_TOOL,
                Some(serde_json::to_value(&params)?),
                options,
            )
            .await?;

        let validator = self.output_validators.lock().unwrap().get(&name).cloned();
        if let Some(validator) = validator {
            if !result.is_error.unwrap_or(false) {
                match &result.structured_content {
                    None => {
                        return Err(Error::protocol(
                            error_codes::INVALID_REQUEST,
                            format!(
                                "Tool {} has an output schema but did not return structured content",
                                name
                            ),
                        ))
                    }
                    Some(content) => {
                        validator.validate(content).map_err(|message| {
                            Error::protocol(
                                error_codes::INVALID_PARAMS,
                                format!(
                                    "Structured content does not match the tool's output schema: {}",
                                    message
                                ),
                            )
                        })?;
                    }
                }
            }
        }

        Ok(result)
    }

    /// Tell the server this client's roots changed. Requires the client to
    /// have declared `roots.listChanged`.
    pub async fn send_roots_list_changed(&self) -> Result<()> {
        assert_client_notification_capability(
            &self.capabilities,
            methods::NOTIFICATION_ROOTS_LIST_CHANGED,
        )?;
        self.session
            .notification(
                methods::NOTIFICATION_ROOTS_LIST_CHANGED,
                None,
                NotificationOptions::default(),
            )
            .await
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
        if self.session.options().enforce_strict_capabilities {
            assert_client_request_handler_capability(&self.capabilities, method)?;
        }
        self.session.set_request_handler(method, handler);
        Ok(())
    }

    /// Register a raw notification handler
    pub fn set_notification_handler(
        &self,
        method: &str,
        handler: impl Fn(Option<Value>) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    ) {
        self.session.set_notification_handler(method, handler);
    }

    /// Handle `sampling/createMessage` requests from the server
    pub fn set_sampling_handler<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(CreateMessageParams, RequestContext) -> BoxFuture<'static, Result<CreateMessageResult>>
            + Send
            + Sync
            + 'static,
    {
        if self.session.options().enforce_strict_capabilities {
            assert_client_request_handler_capability(&self.capabilities, methods::CREATE_MESSAGE)?;
        }
        let handler = Arc::new(handler);
        self.session
            .set_request_handler(methods::CREATE_MESSAGE, move |params, ctx| {
                let handler = handler.clone();
                Box::pin(async move {
                    let params: CreateMessageParams = parse_params(params)?;
                    let result = handler(params, ctx).await?;
                    Ok(serde_json::to_value(result)?)
                })
            });
        Ok(())
    }

    /// Handle `roots/list` requests from the server
    pub fn set_roots_handler<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(RequestContext) -> BoxFuture<'static, Result<ListRootsResult>>
            + Send
            + Sync
            + 'static,
    {
        if self.session.options().enforce_strict_capabilities {
            assert_client_request_handler_capability(&self.capabilities, methods::LIST_ROOTS)?;
        }
        let handler = Arc::new(handler);
        self.session
            .set_request_handler(methods::LIST_ROOTS, move |_params, ctx| {
                let handler = handler.clone();
                Box::pin(async move {
                    let result = handler(ctx).await?;
                    Ok(serde_json::to_value(result)?)
                })
            });
        Ok(())
    }

    /// Handle `elicitation/create` requests from the server.
    ///
    /// The handler is wrapped so that each inbound elicitation is mode-gated
    /// against this client's declared capabilities, the result is
    /// shape-checked, and, when `form.applyDefaults` was declared, missing
    /// defaulted fields of an accepted form result are filled from the
    /// requested schema.
    pub fn set_elicitation_handler<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(ElicitParams, RequestContext) -> BoxFuture<'static, Result<ElicitResult>>
            + Send
            + Sync
            + 'static,
    {
        if self.session.options().enforce_strict_capabilities {
            assert_client_request_handler_capability(
                &self.capabilities,
                methods::ELICITATION_CREATE,
            )?;
        }

        let handler = Arc::new(handler);
        let capabilities = self.capabilities.clone();
        self.session
            .set_request_handler(methods::ELICITATION_CREATE, move |params, ctx| {
                let handler = handler.clone();
                let capabilities = capabilities.clone();
                Box::pin(async move {
                    let request: ElicitParams = parse_params(params)?;
                    let mode = request.mode.unwrap_or(ElicitationMode::Form);
                    let elicitation = capabilities.elicitation.as_ref();

                    match mode {
                        ElicitationMode::Form if !supports_form_elicitation(elicitation) => {
                            return Err(Error::protocol(
                                error_codes::INVALID_REQUEST,
                                "Client does not support form elicitation",
                            ))
                        }
                        ElicitationMode::Url if !supports_url_elicitation(elicitation) => {
                            return Err(Error::protocol(
                                error_codes::INVALID_REQUEST,
                                "Client does not support url elicitation",
                            ))
                        }
                        _ => {}
                    }

                    let requested_schema = request.requested_schema.clone();
                    let mut result = handler(request, ctx).await?;

                    if mode == ElicitationMode::Form
                        && result.action == ElicitationAction::Accept
                    {
                        if let Some(schema) = &requested_schema {
                            if applies_form_defaults(capabilities.elicitation.as_ref()) {
                                apply_defaults_to_content(schema, &mut result.content);
                            }
                        }
                    }

                    Ok(serde_json::to_value(result)?)
                })
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ElicitationCapability;

    #[test]
    fn test_client_normalizes_own_capabilities() {
        let client = McpClient::new(
            ClientInfo {
                name: "test-client".to_string(),
                version: "1.0.0".to_string(),
                title: None,
            },
            ClientCapabilities {
                elicitation: Some(ElicitationCapability::default()),
                ..Default::default()
            },
        );
        assert!(supports_form_elicitation(
            client.capabilities().elicitation.as_ref()
        ));
    }

    #[test]
    fn test_strict_mode_rejects_undeclared_elicitation_handler() {
        let options = ClientOptions {
            session: SessionOptions {
                enforce_strict_capabilities: true,
                ..Default::default()
            },
        };
        let client = McpClient::with_options(
            ClientInfo {
                name: "test-client".to_string(),
                version: "1.0.0".to_string(),
                title: None,
            },
            ClientCapabilities::default(),
            options,
        );

        let err = client
            .set_elicitation_handler(|_params, _ctx| {
                Box::pin(async {
                    Ok(ElicitResult {
                        action: ElicitationAction::Decline,
                        content: None,
                    })
                })
            })
            .unwrap_err();
        assert_eq!(err.to_string(), "Client does not support elicitation");
    }

    #[tokio::test]
    async fn test_requests_require_connection() {
        let client = McpClient::new(
            ClientInfo {
                name: "test-client".to_string(),
                version: "1.0.0".to_string(),
                title: None,
            },
            ClientCapabilities::default(),
        );
        let err = client.ping().await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed(_)));
    }
}
