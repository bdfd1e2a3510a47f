//! Protocol multiplexer shared by both roles
//!
//! A [`Session`] owns one connection: it correlates outgoing requests with
//! incoming responses, tracks concurrent in-flight requests in both
//! directions, streams progress, propagates cancellation, enforces
//! per-request deadlines, and coalesces debounced notifications. The client
//! and server roles layer their typed methods on top of this engine.
//!
//! All writes to the transport funnel through a single driver task, so frame
//! ordering from this side follows enqueue order.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::{
    methods, CancelledParams, ErrorObject, JsonRpcError, JsonRpcMessage, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, ProgressParams, ProgressToken, RequestId,
};
use crate::transport::Transport;
use crate::{Error, Result};

/// Default per-request timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Initializing,
    Ready,
    Closing,
    Closed,
}

/// A cancellation handle for an outgoing request, carrying the caller's
/// reason for the peer.
#[derive(Clone, Default)]
pub struct CancelSignal {
    inner: Arc<CancelSignalInner>,
}

#[derive(Default)]
struct CancelSignalInner {
    token: CancellationToken,
    reason: StdMutex<Option<String>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the associated request. The reason is sent to the peer in
    /// `notifications/cancelled` and returned verbatim to the caller.
    pub fn cancel(&self, reason: impl Into<String>) {
        *self.inner.reason.lock().unwrap() = Some(reason.into());
        self.inner.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await
    }

    pub fn reason(&self) -> Option<String> {
        self.inner.reason.lock().unwrap().clone()
    }
}

/// Callback invoked for each progress notification matching a request
pub type ProgressCallback = Arc<dyn Fn(ProgressParams) + Send + Sync>;

/// Type-erased handler for an incoming request
pub type RequestHandler =
    Arc<dyn Fn(Option<Value>, RequestContext) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Type-erased handler for an incoming notification
pub type NotificationHandler =
    Arc<dyn Fn(Option<Value>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

type CloseCallback = Box<dyn Fn() + Send + Sync>;
type ErrorCallback = Box<dyn Fn(&Error) + Send + Sync>;

/// Per-connection engine configuration
#[derive(Default, Clone)]
pub struct SessionOptions {
    /// Refuse handler registration for methods whose capability this side
    /// did not declare.
    pub enforce_strict_capabilities: bool,
    /// Notification methods eligible for next-tick coalescing. Typically the
    /// list-changed family.
    pub debounced_notification_methods: HashSet<String>,
}

/// Per-request options
#[derive(Clone)]
pub struct RequestOptions {
    /// Deadline for the response, measured from send (and from the last
    /// progress notification when `reset_timeout_on_progress` is set).
    pub timeout: Duration,
    /// Hard ceiling measured from send, regardless of progress resets.
    pub max_total_timeout: Option<Duration>,
    /// Restart the per-request timeout whenever progress arrives.
    pub reset_timeout_on_progress: bool,
    /// External cancellation handle.
    pub cancel: Option<CancelSignal>,
    /// Receives progress notifications correlated with this request. Setting
    /// this injects `_meta.progressToken` into the outgoing frame.
    pub on_progress: Option<ProgressCallback>,
    /// Correlates this request with an inbound request being serviced.
    pub related_request_id: Option<RequestId>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_REQUEST_TIMEOUT,
            max_total_timeout: None,
            reset_timeout_on_progress: false,
            cancel: None,
            on_progress: None,
            related_request_id: None,
        }
    }
}

/// Per-notification options
#[derive(Default, Clone)]
pub struct NotificationOptions {
    /// Correlates the notification with an inbound request; carried in
    /// `_meta.relatedRequestId` and exempts the frame from debouncing.
    pub related_request_id: Option<RequestId>,
}

/// Context handed to request handlers
#[derive(Clone)]
pub struct RequestContext {
    /// Id of the request being serviced
    pub request_id: RequestId,
    /// Cancelled when the peer sends `notifications/cancelled` for this
    /// request or the connection closes. Handlers are expected to observe it.
    pub cancel: CancellationToken,
    /// The request's `_meta` mapping, if any
    pub meta: Option<Value>,
    /// Progress token extracted from `_meta`, if the caller asked for
    /// progress
    pub progress_token: Option<ProgressToken>,
    /// Transport session id, when the transport is sessioned
    pub session_id: Option<String>,
    /// The owning session, for sending notifications from within a handler
    pub session: Session,
}

impl RequestContext {
    /// Emit a progress notification for this request. A no-op when the
    /// caller did not request progress.
    pub async fn send_progress(
        &self,
        progress: f64,
        total: Option<f64>,
        message: Option<String>,
    ) -> Result<()> {
        let Some(token) = &self.progress_token else {
            return Ok(());
        };
        let params = ProgressParams {
            progress_token: token.clone(),
            progress,
            total,
            message,
        };
        self.session
            .notification(
                methods::NOTIFICATION_PROGRESS,
                Some(serde_json::to_value(&params)?),
                NotificationOptions::default(),
            )
            .await
    }
}

/// A locally originated request awaiting its response
struct PendingRequest {
    method: String,
    responder: oneshot::Sender<Result<Value>>,
    progress: Option<ProgressCallback>,
    deadline_tx: watch::Sender<Instant>,
    timeout: Duration,
    max_total_timeout: Option<Duration>,
    reset_timeout_on_progress: bool,
    started_at: Instant,
    created_at: chrono::DateTime<chrono::Utc>,
}

enum Outbound {
    Frame(JsonRpcMessage),
    SetProtocolVersion(String),
}

struct SessionInner {
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    outbound_rx: StdMutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
    pending: DashMap<i64, PendingRequest>,
    in_flight: DashMap<RequestId, CancellationToken>,
    request_handlers: DashMap<String, RequestHandler>,
    notification_handlers: DashMap<String, NotificationHandler>,
    next_request_id: AtomicI64,
    debounce_pending: StdMutex<HashSet<String>>,
    options: SessionOptions,
    state: StdMutex<ConnectionState>,
    close_token: CancellationToken,
    close_fired: AtomicBool,
    on_close: StdMutex<Option<CloseCallback>>,
    on_error: StdMutex<Option<ErrorCallback>>,
    transport_session_id: StdMutex<Option<String>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

/// One end of an MCP connection: the shared protocol engine
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Create a disconnected session with the given engine options
    pub fn new(options: SessionOptions) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(SessionInner {
                outbound_tx,
                outbound_rx: StdMutex::new(Some(outbound_rx)),
                pending: DashMap::new(),
                in_flight: DashMap::new(),
                request_handlers: DashMap::new(),
                notification_handlers: DashMap::new(),
                next_request_id: AtomicI64::new(0),
                debounce_pending: StdMutex::new(HashSet::new()),
                options,
                state: StdMutex::new(ConnectionState::Disconnected),
                close_token: CancellationToken::new(),
                close_fired: AtomicBool::new(false),
                on_close: StdMutex::new(None),
                on_error: StdMutex::new(None),
                transport_session_id: StdMutex::new(None),
                driver: Mutex::new(None),
            }),
        }
    }

    /// Engine options for this session
    pub fn options(&self) -> &SessionOptions {
        &self.inner.options
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().unwrap()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        *self.inner.state.lock().unwrap() = state;
    }

    /// The transport's session id, when the transport is sessioned
    pub fn transport_session_id(&self) -> Option<String> {
        self.inner.transport_session_id.lock().unwrap().clone()
    }

    /// Install the close callback; fired exactly once when the connection
    /// fully closes.
    pub fn on_close(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.inner.on_close.lock().unwrap() = Some(Box::new(callback));
    }

    /// Install the error callback for transport and dispatch failures that
    /// have no request to attach to.
    pub fn on_error(&self, callback: impl Fn(&Error) + Send + Sync + 'static) {
        *self.inner.on_error.lock().unwrap() = Some(Box::new(callback));
    }

    /// Attach a transport and start the driver task. The initialization
    /// handshake is the role's responsibility.
    pub async fn connect(&self, mut transport: Box<dyn Transport>) -> Result<()> {
        let rx = self
            .inner
            .outbound_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::ConnectionClosed("Session already connected".to_string()))?;

        self.set_state(ConnectionState::Connecting);
        if let Err(e) = transport.start().await {
            self.set_state(ConnectionState::Closed);
            return Err(e);
        }
        *self.inner.transport_session_id.lock().unwrap() = transport.session_id();

        let inner = self.inner.clone();
        let handle = tokio::spawn(run_driver(inner, transport, rx));
        *self.inner.driver.lock().await = Some(handle);
        Ok(())
    }

    /// Send a request and await its correlated response.
    ///
    /// Resolution happens on the first of: a matching response or error
    /// frame, external cancellation, deadline expiry, or connection close.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        options: RequestOptions,
    ) -> Result<Value> {
        match self.state() {
            ConnectionState::Disconnected
            | ConnectionState::Closing
            | ConnectionState::Closed => {
                return Err(Error::ConnectionClosed("Not connected".to_string()))
            }
            _ => {}
        }

        let id_num = self.inner.next_request_id.fetch_add(1, Ordering::SeqCst);
        let id = RequestId::Number(id_num);

        let mut params = params;
        if options.on_progress.is_some() {
            set_meta_field(&mut params, "progressToken", json!(id_num));
        }
        if let Some(related) = &options.related_request_id {
            set_meta_field(&mut params, "relatedRequestId", json!(related));
        }

        let started_at = Instant::now();
        let mut initial_deadline = started_at + options.timeout;
        if let Some(max) = options.max_total_timeout {
            initial_deadline = initial_deadline.min(started_at + max);
        }

        let (responder_tx, mut responder_rx) = oneshot::channel();
        let (deadline_tx, mut deadline_rx) = watch::channel(initial_deadline);

        self.inner.pending.insert(
            id_num,
            PendingRequest {
                method: method.to_string(),
                responder: responder_tx,
                progress: options.on_progress.clone(),
                deadline_tx,
                timeout: options.timeout,
                max_total_timeout: options.max_total_timeout,
                reset_timeout_on_progress: options.reset_timeout_on_progress,
                started_at,
                created_at: chrono::Utc::now(),
            },
        );

        let frame =
            JsonRpcMessage::Request(JsonRpcRequest::new(id.clone(), method, params));
        if let Err(e) = self.inner.enqueue(frame) {
            self.inner.pending.remove(&id_num);
            return Err(e);
        }
        debug!(method, id = id_num, "Sent request");

        let cancel = options.cancel.clone();
        loop {
            let deadline = *deadline_rx.borrow_and_update();
            tokio::select! {
                result = &mut responder_rx => {
                    return result.unwrap_or_else(|_| {
                        Err(Error::ConnectionClosed("Connection closed".to_string()))
                    });
                }
                _ = wait_cancelled(&cancel) => {
                    if let Some((_, pending)) = self.inner.pending.remove(&id_num) {
                        debug!(id = id_num, method = %pending.method, "Request cancelled by caller");
                    }
                    let reason = cancel
                        .as_ref()
                        .and_then(|c| c.reason())
                        .unwrap_or_else(|| "Request cancelled".to_string());
                    let _ = self.send_cancelled(id.clone(), reason.clone());
                    return Err(Error::Cancelled(reason));
                }
                _ = tokio::time::sleep_until(deadline.into()) => {
                    // The deadline may have been pushed out by a progress
                    // notification while this sleep was armed.
                    if deadline_rx.has_changed().unwrap_or(false) {
                        continue;
                    }
                    let elapsed = started_at.elapsed().as_millis();
                    if let Some((_, pending)) = self.inner.pending.remove(&id_num) {
                        warn!(
                            id = id_num,
                            method = %pending.method,
                            created_at = %pending.created_at,
                            "Request timed out"
                        );
                    }
                    let _ = self.send_cancelled(
                        id.clone(),
                        format!("Request timed out after {} ms", elapsed),
                    );
                    return Err(Error::RequestTimeout(elapsed));
                }
            }
        }
    }

    fn send_cancelled(&self, request_id: RequestId, reason: String) -> Result<()> {
        let params = CancelledParams {
            request_id,
            reason: Some(reason),
        };
        let frame = JsonRpcMessage::Notification(JsonRpcNotification::new(
            methods::NOTIFICATION_CANCELLED,
            Some(serde_json::to_value(&params)?),
        ));
        self.inner.enqueue(frame)
    }

    /// Send a fire-and-forget notification.
    ///
    /// Methods in the configured debounce set, carrying neither params nor a
    /// related request id, are coalesced: concurrent emissions within one
    /// scheduler tick produce a single frame.
    pub async fn notification(
        &self,
        method: &str,
        params: Option<Value>,
        options: NotificationOptions,
    ) -> Result<()> {
        match self.state() {
            ConnectionState::Disconnected
            | ConnectionState::Closing
            | ConnectionState::Closed => {
                return Err(Error::ConnectionClosed("Not connected".to_string()))
            }
            _ => {}
        }

        let debounce = params.is_none()
            && options.related_request_id.is_none()
            && self
                .inner
                .options
                .debounced_notification_methods
                .contains(method);

        if debounce {
            {
                let mut scheduled = self.inner.debounce_pending.lock().unwrap();
                if !scheduled.insert(method.to_string()) {
                    return Ok(());
                }
            }
            let inner = self.inner.clone();
            let method = method.to_string();
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                inner.debounce_pending.lock().unwrap().remove(&method);
                let frame =
                    JsonRpcMessage::Notification(JsonRpcNotification::new(&method, None));
                if let Err(e) = inner.enqueue(frame) {
                    debug!(method = %method, error = %e, "Dropped debounced notification");
                }
            });
            return Ok(());
        }

        let mut params = params;
        if let Some(related) = &options.related_request_id {
            set_meta_field(&mut params, "relatedRequestId", json!(related));
        }
        let frame = JsonRpcMessage::Notification(JsonRpcNotification::new(method, params));
        self.inner.enqueue(frame)
    }

    /// Register a handler for an incoming request method. Replaces any
    /// previous handler for the method.
    pub fn set_request_handler(
        &self,
        method: &str,
        handler: impl Fn(Option<Value>, RequestContext) -> BoxFuture<'static, Result<Value>>
            + Send
            + Sync
            + 'static,
    ) {
        self.inner
            .request_handlers
            .insert(method.to_string(), Arc::new(handler));
    }

    /// Register a handler for an incoming notification method. Handler
    /// errors are logged and swallowed.
    pub fn set_notification_handler(
        &self,
        method: &str,
        handler: impl Fn(Option<Value>) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    ) {
        self.inner
            .notification_handlers
            .insert(method.to_string(), Arc::new(handler));
    }

    /// Remove the handler for a request method
    pub fn remove_request_handler(&self, method: &str) {
        self.inner.request_handlers.remove(method);
    }

    /// Forward the negotiated protocol version to the transport
    pub fn set_protocol_version(&self, version: &str) {
        let _ = self
            .inner
            .outbound_tx
            .send(Outbound::SetProtocolVersion(version.to_string()));
    }

    /// Close the connection: every outstanding request is rejected, the
    /// transport is closed, and the close callback fires exactly once.
    pub async fn close(&self) {
        self.set_state(ConnectionState::Closing);
        self.inner.close_token.cancel();
        let handle = self.inner.driver.lock().await.take();
        match handle {
            Some(handle) => {
                let _ = handle.await;
            }
            None => self.inner.finalize_close(),
        }
    }
}

/// Decode handler params, mapping absent params to the empty object and
/// decode failures to an invalid-params error.
pub fn parse_params<P: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<P> {
    serde_json::from_value(params.unwrap_or_else(|| json!({})))
        .map_err(|e| Error::invalid_params(e.to_string()))
}

async fn wait_cancelled(cancel: &Option<CancelSignal>) {
    match cancel {
        Some(signal) => signal.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Merge a key into `params._meta`, creating the object spine as needed
fn set_meta_field(params: &mut Option<Value>, key: &str, value: Value) {
    let params = params.get_or_insert_with(|| json!({}));
    if !params.is_object() {
        return;
    }
    let meta = params
        .as_object_mut()
        .unwrap()
        .entry("_meta")
        .or_insert_with(|| json!({}));
    if let Some(meta) = meta.as_object_mut() {
        meta.insert(key.to_string(), value);
    }
}

async fn run_driver(
    inner: Arc<SessionInner>,
    mut transport: Box<dyn Transport>,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
) {
    loop {
        tokio::select! {
            biased;
            _ = inner.close_token.cancelled() => {
                // Flush frames already queued (cancellation notices among
                // them) before tearing the channel down.
                while let Ok(outgoing) = outbound_rx.try_recv() {
                    if let Outbound::Frame(message) = outgoing {
                        let _ = transport.send(&message).await;
                    }
                }
                break;
            }
            outgoing = outbound_rx.recv() => match outgoing {
                Some(Outbound::Frame(message)) => {
                    if let Err(e) = transport.send(&message).await {
                        warn!(error = %e, "Failed to send frame");
                        inner.report_error(&e);
                    }
                }
                Some(Outbound::SetProtocolVersion(version)) => {
                    transport.set_protocol_version(&version);
                }
                None => break,
            },
            incoming = transport.receive() => match incoming {
                Ok(message) => inner.dispatch(message),
                Err(e) => {
                    if !matches!(e, Error::ConnectionClosed(_)) {
                        inner.report_error(&e);
                    }
                    break;
                }
            }
        }
    }

    let _ = transport.close().await;
    inner.finalize_close();
}

impl SessionInner {
    fn enqueue(&self, message: JsonRpcMessage) -> Result<()> {
        self.outbound_tx
            .send(Outbound::Frame(message))
            .map_err(|_| Error::ConnectionClosed("Connection closed".to_string()))
    }

    fn report_error(&self, error: &Error) {
        if let Some(callback) = self.on_error.lock().unwrap().as_ref() {
            callback(error);
        } else {
            warn!(error = %error, "Unhandled session error");
        }
    }

    fn dispatch(self: &Arc<Self>, message: JsonRpcMessage) {
        match message {
            JsonRpcMessage::Request(request) => self.dispatch_request(request),
            JsonRpcMessage::Notification(notification) => {
                self.dispatch_notification(notification)
            }
            JsonRpcMessage::Response(response) => self.dispatch_response(response),
            JsonRpcMessage::Error(error) => self.dispatch_error(error),
        }
    }

    fn dispatch_request(self: &Arc<Self>, request: JsonRpcRequest) {
        let Some(handler) = self
            .request_handlers
            .get(&request.method)
            .map(|entry| entry.clone())
        else {
            warn!(method = %request.method, "No handler for method");
            let error = JsonRpcError::new(
                Some(request.id),
                ErrorObject {
                    code: crate::protocol::error_codes::METHOD_NOT_FOUND,
                    message: "Method not found".to_string(),
                    data: None,
                },
            );
            let _ = self.enqueue(JsonRpcMessage::Error(error));
            return;
        };

        let cancel = CancellationToken::new();
        self.in_flight.insert(request.id.clone(), cancel.clone());

        let inner = self.clone();
        tokio::spawn(async move {
            let meta = request
                .params
                .as_ref()
                .and_then(|p| p.get("_meta"))
                .cloned();
            let progress_token = meta
                .as_ref()
                .and_then(|m| m.get("progressToken"))
                .and_then(|v| serde_json::from_value::<ProgressToken>(v.clone()).ok());
            let context = RequestContext {
                request_id: request.id.clone(),
                cancel: cancel.clone(),
                meta,
                progress_token,
                session_id: inner.transport_session_id.lock().unwrap().clone(),
                session: Session {
                    inner: inner.clone(),
                },
            };

            let result = handler(request.params, context).await;
            inner.in_flight.remove(&request.id);

            if cancel.is_cancelled() {
                debug!(id = %request.id, "Result suppressed for cancelled request");
                return;
            }

            let frame = match result {
                Ok(value) => {
                    JsonRpcMessage::Response(JsonRpcResponse::new(request.id, value))
                }
                Err(e) => JsonRpcMessage::Error(JsonRpcError::new(
                    Some(request.id),
                    e.to_error_object(),
                )),
            };
            let _ = inner.enqueue(frame);
        });
    }

    fn dispatch_notification(self: &Arc<Self>, notification: JsonRpcNotification) {
        match notification.method.as_str() {
            methods::NOTIFICATION_PROGRESS => {
                let Some(params) = notification
                    .params
                    .and_then(|p| serde_json::from_value::<ProgressParams>(p).ok())
                else {
                    debug!("Dropping malformed progress notification");
                    return;
                };
                self.dispatch_progress(params);
            }
            methods::NOTIFICATION_CANCELLED => {
                let Some(params) = notification
                    .params
                    .and_then(|p| serde_json::from_value::<CancelledParams>(p).ok())
                else {
                    debug!("Dropping malformed cancellation notification");
                    return;
                };
                if let Some(entry) = self.in_flight.get(&params.request_id) {
                    debug!(
                        id = %params.request_id,
                        reason = params.reason.as_deref().unwrap_or(""),
                        "Peer cancelled in-flight request"
                    );
                    entry.cancel();
                }
            }
            method => {
                let Some(handler) = self
                    .notification_handlers
                    .get(method)
                    .map(|entry| entry.clone())
                else {
                    debug!(method, "Dropping unhandled notification");
                    return;
                };
                let method = method.to_string();
                tokio::spawn(async move {
                    if let Err(e) = handler(notification.params).await {
                        warn!(method = %method, error = %e, "Notification handler failed");
                    }
                });
            }
        }
    }

    fn dispatch_progress(&self, params: ProgressParams) {
        let ProgressToken::Number(token) = &params.progress_token else {
            debug!("Dropping progress notification with foreign token");
            return;
        };
        let token = *token;
        let Some(entry) = self.pending.get(&token) else {
            debug!(token, "Dropping progress for unknown request");
            return;
        };

        let callback = entry.progress.clone();
        if entry.reset_timeout_on_progress {
            let mut deadline = Instant::now() + entry.timeout;
            if let Some(max) = entry.max_total_timeout {
                deadline = deadline.min(entry.started_at + max);
            }
            let _ = entry.deadline_tx.send(deadline);
        }
        // Release the table guard before running user code.
        drop(entry);

        if let Some(callback) = callback {
            callback(params);
        }
    }

    fn dispatch_response(&self, response: JsonRpcResponse) {
        let id = match response.id {
            RequestId::Number(id) => id,
            other => {
                debug!(id = %other, "Dropping response with foreign id");
                return;
            }
        };
        let Some((_, pending)) = self.pending.remove(&id) else {
            // Cancelled or timed out locally; the late response is dropped.
            debug!(id, "Dropping response for unknown request");
            return;
        };
        debug!(id, method = %pending.method, "Request resolved");
        let _ = pending.responder.send(Ok(response.result));
    }

    fn dispatch_error(&self, error: JsonRpcError) {
        match error.id {
            Some(RequestId::Number(id)) => {
                let Some((_, pending)) = self.pending.remove(&id) else {
                    debug!(id, "Dropping error for unknown request");
                    return;
                };
                let err = Error::from_error_object(error.error, &RequestId::Number(id));
                let _ = pending.responder.send(Err(err));
            }
            _ => {
                // No id to correlate with; surface through the error callback.
                self.report_error(&Error::protocol(error.error.code, error.error.message));
            }
        }
    }

    fn finalize_close(self: &Arc<Self>) {
        *self.state.lock().unwrap() = ConnectionState::Closed;

        let outstanding: Vec<i64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in outstanding {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let _ = pending
                    .responder
                    .send(Err(Error::ConnectionClosed("Connection closed".to_string())));
            }
        }

        for entry in self.in_flight.iter() {
            entry.value().cancel();
        }
        self.in_flight.clear();

        if !self.close_fired.swap(true, Ordering::SeqCst) {
            if let Some(callback) = self.on_close.lock().unwrap().as_ref() {
                callback();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryTransport;
    use std::sync::atomic::AtomicUsize;

    async fn connected_pair() -> (Session, Session) {
        let (a, b) = InMemoryTransport::pair();
        let left = Session::new(SessionOptions::default());
        let right = Session::new(SessionOptions::default());
        left.connect(Box::new(a)).await.unwrap();
        right.connect(Box::new(b)).await.unwrap();
        left.set_state(ConnectionState::Ready);
        right.set_state(ConnectionState::Ready);
        (left, right)
    }

    #[tokio::test]
    async fn test_request_response_correlation() {
        let (left, right) = connected_pair().await;

        right.set_request_handler("echo", |params, _ctx| {
            Box::pin(async move { Ok(params.unwrap_or(json!(null))) })
        });

        let result = left
            .request("echo", Some(json!({"x": 1})), RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(result["x"], 1);
    }

    #[tokio::test]
    async fn test_concurrent_requests_resolve_independently() {
        let (left, right) = connected_pair().await;

        right.set_request_handler("slow", |_params, _ctx| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(json!("slow"))
            })
        });
        right.set_request_handler("fast", |_params, _ctx| {
            Box::pin(async move { Ok(json!("fast")) })
        });

        let slow = left.request("slow", None, RequestOptions::default());
        let fast = left.request("fast", None, RequestOptions::default());
        let (slow, fast) = tokio::join!(slow, fast);
        assert_eq!(slow.unwrap(), json!("slow"));
        assert_eq!(fast.unwrap(), json!("fast"));
        assert!(left.inner.pending.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_method_yields_method_not_found() {
        let (left, _right) = connected_pair().await;

        let err = left
            .request("no/such", None, RequestOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::protocol::error_codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cancellation_rejects_with_reason_verbatim() {
        let (left, right) = connected_pair().await;

        right.set_request_handler("hang", |_params, ctx| {
            Box::pin(async move {
                ctx.cancel.cancelled().await;
                Ok(json!(null))
            })
        });

        let cancel = CancelSignal::new();
        let options = RequestOptions {
            cancel: Some(cancel.clone()),
            ..Default::default()
        };
        let request = left.request("hang", None, options);
        cancel.cancel("Cancelled by test");

        let err = request.await.unwrap_err();
        match err {
            Error::Cancelled(reason) => assert_eq!(reason, "Cancelled by test"),
            other => panic!("expected cancellation, got {:?}", other),
        }
        assert!(left.inner.pending.is_empty());
    }

    #[tokio::test]
    async fn test_zero_timeout_rejects_and_notifies_peer() {
        let (left, right) = connected_pair().await;

        let cancelled = Arc::new(AtomicUsize::new(0));
        let observed = cancelled.clone();
        right.set_request_handler("hang", move |_params, ctx| {
            let observed = observed.clone();
            Box::pin(async move {
                ctx.cancel.cancelled().await;
                observed.fetch_add(1, Ordering::SeqCst);
                Ok(json!(null))
            })
        });

        let options = RequestOptions {
            timeout: Duration::from_millis(0),
            ..Default::default()
        };
        let err = left.request("hang", None, options).await.unwrap_err();
        assert!(matches!(err, Error::RequestTimeout(_)));

        // The cancellation notification must reach the peer's handler.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_progress_routes_to_matching_request() {
        let (left, right) = connected_pair().await;

        right.set_request_handler("work", |_params, ctx| {
            Box::pin(async move {
                ctx.send_progress(0.5, Some(1.0), None).await?;
                ctx.send_progress(1.0, Some(1.0), None).await?;
                Ok(json!("done"))
            })
        });

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let options = RequestOptions {
            on_progress: Some(Arc::new(move |p: ProgressParams| {
                sink.lock().unwrap().push(p.progress);
            })),
            ..Default::default()
        };

        let result = left.request("work", None, options).await.unwrap();
        assert_eq!(result, json!("done"));
        assert_eq!(*seen.lock().unwrap(), vec![0.5, 1.0]);
    }

    #[tokio::test]
    async fn test_progress_resets_timeout() {
        let (left, right) = connected_pair().await;

        right.set_request_handler("drip", |_params, ctx| {
            Box::pin(async move {
                for _ in 0..4 {
                    tokio::time::sleep(Duration::from_millis(60)).await;
                    ctx.send_progress(0.25, None, None).await?;
                }
                Ok(json!("done"))
            })
        });

        // Each gap is longer than the timeout alone, but progress keeps
        // resetting the deadline.
        let options = RequestOptions {
            timeout: Duration::from_millis(100),
            reset_timeout_on_progress: true,
            on_progress: Some(Arc::new(|_| {})),
            ..Default::default()
        };
        let result = left.request("drip", None, options).await.unwrap();
        assert_eq!(result, json!("done"));
    }

    #[tokio::test]
    async fn test_max_total_timeout_caps_progress_resets() {
        let (left, right) = connected_pair().await;

        right.set_request_handler("drip", |_params, ctx| {
            Box::pin(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    if ctx.cancel.is_cancelled() {
                        return Ok(json!(null));
                    }
                    ctx.send_progress(0.1, None, None).await?;
                }
            })
        });

        let options = RequestOptions {
            timeout: Duration::from_millis(100),
            max_total_timeout: Some(Duration::from_millis(200)),
            reset_timeout_on_progress: true,
            on_progress: Some(Arc::new(|_| {})),
            ..Default::default()
        };
        let started = Instant::now();
        let err = left.request("drip", None, options).await.unwrap_err();
        assert!(matches!(err, Error::RequestTimeout(_)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_debounced_notifications_coalesce() {
        let mut options = SessionOptions::default();
        options
            .debounced_notification_methods
            .insert("notifications/tools/list_changed".to_string());

        let (a, b) = InMemoryTransport::pair();
        let left = Session::new(options);
        let right = Session::new(SessionOptions::default());
        left.connect(Box::new(a)).await.unwrap();
        right.connect(Box::new(b)).await.unwrap();
        left.set_state(ConnectionState::Ready);
        right.set_state(ConnectionState::Ready);

        let count = Arc::new(AtomicUsize::new(0));
        let sink = count.clone();
        right.set_notification_handler("notifications/tools/list_changed", move |_params| {
            let sink = sink.clone();
            Box::pin(async move {
                sink.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });

        for _ in 0..5 {
            left.notification(
                "notifications/tools/list_changed",
                None,
                NotificationOptions::default(),
            )
            .await
            .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // A later burst delivers again.
        left.notification(
            "notifications/tools/list_changed",
            None,
            NotificationOptions::default(),
        )
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_debounced_notifications_all_deliver() {
        let (left, right) = connected_pair().await;

        let count = Arc::new(AtomicUsize::new(0));
        let sink = count.clone();
        right.set_notification_handler("tick", move |_params| {
            let sink = sink.clone();
            Box::pin(async move {
                sink.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });

        for _ in 0..5 {
            left.notification("tick", None, NotificationOptions::default())
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_close_rejects_outstanding_and_fires_on_close_once() {
        let (left, right) = connected_pair().await;

        right.set_request_handler("hang", |_params, ctx| {
            Box::pin(async move {
                ctx.cancel.cancelled().await;
                Ok(json!(null))
            })
        });

        let closes = Arc::new(AtomicUsize::new(0));
        let sink = closes.clone();
        left.on_close(move || {
            sink.fetch_add(1, Ordering::SeqCst);
        });

        let left2 = left.clone();
        let outstanding =
            tokio::spawn(async move { left2.request("hang", None, RequestOptions::default()).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        left.close().await;
        left.close().await;

        let err = outstanding.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed(_)));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(left.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_peer_drop_fires_on_close() {
        let (left, right) = connected_pair().await;

        let closes = Arc::new(AtomicUsize::new(0));
        let sink = closes.clone();
        left.on_close(move || {
            sink.fetch_add(1, Ordering::SeqCst);
        });

        right.close().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_meta_injection_preserves_params() {
        let mut params = Some(json!({"name": "x"}));
        set_meta_field(&mut params, "progressToken", json!(7));
        let value = params.unwrap();
        assert_eq!(value["name"], "x");
        assert_eq!(value["_meta"]["progressToken"], 7);
    }

    #[tokio::test]
    async fn test_request_ids_are_monotonic() {
        let (left, right) = connected_pair().await;

        let ids = Arc::new(StdMutex::new(Vec::new()));
        let sink = ids.clone();
        right.set_request_handler("id", move |_params, ctx| {
            let sink = sink.clone();
            Box::pin(async move {
                sink.lock().unwrap().push(ctx.request_id.clone());
                Ok(json!(null))
            })
        });

        for _ in 0..3 {
            left.request("id", None, RequestOptions::default())
                .await
                .unwrap();
        }
        let ids = ids.lock().unwrap();
        assert_eq!(
            *ids,
            vec![
                RequestId::Number(0),
                RequestId::Number(1),
                RequestId::Number(2)
            ]
        );
    }
}
