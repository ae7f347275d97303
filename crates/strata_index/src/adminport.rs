//! Admin server for administration and system messages.
//!
//! A message type is registered under `url_prefix + name`; the HTTP
//! dispatcher decodes the body into a fresh message instance, forwards an
//! in-memory request to the application's inbound queue, and answers with
//! whatever the application replies. The stats sub-path serves the counter
//! document as JSON.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;

use crate::error::AdminError;
use crate::stats::{AdminStats, AdminStatsSnapshot};

/// A decoded admin message; responses implement the same trait.
pub trait AdminMessage: Send + Sync + std::fmt::Debug + 'static {
    fn name(&self) -> &'static str;
    fn content_type(&self) -> &'static str {
        "application/octet-stream"
    }
    fn encode(&self) -> Result<Vec<u8>, AdminError>;
    fn as_any(&self) -> &dyn Any;
}

/// Factory bound to one registered message name.
pub trait MessageMarshaller: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    fn decode(&self, data: &[u8]) -> Result<Box<dyn AdminMessage>, AdminError>;
}

/// Serde message types declare their registered name through this trait.
pub trait NamedMessage:
    Serialize + DeserializeOwned + Send + Sync + std::fmt::Debug + 'static
{
    const NAME: &'static str;
}

/// JSON body wrapper giving any `NamedMessage` the `AdminMessage` surface.
#[derive(Debug)]
pub struct JsonBody<T>(pub T);

impl<T: NamedMessage> AdminMessage for JsonBody<T> {
    fn name(&self) -> &'static str {
        T::NAME
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn encode(&self) -> Result<Vec<u8>, AdminError> {
        serde_json::to_vec(&self.0).map_err(|err| AdminError::Internal(err.to_string()))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// JSON marshaller for a `NamedMessage`.
pub struct JsonMarshaller<T>(PhantomData<T>);

impl<T> Default for JsonMarshaller<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T: NamedMessage> MessageMarshaller for JsonMarshaller<T> {
    fn name(&self) -> &'static str {
        T::NAME
    }

    fn decode(&self, data: &[u8]) -> Result<Box<dyn AdminMessage>, AdminError> {
        let body: T = serde_json::from_slice(data).map_err(|_| AdminError::DecodeRequest)?;
        Ok(Box::new(JsonBody(body)))
    }
}

/// Reply the application produces for one admin request.
pub enum AdminResponse {
    Message(Box<dyn AdminMessage>),
    Error(String),
}

/// In-memory request handed to the application's inbound queue.
pub struct AdminRequest {
    msg: Box<dyn AdminMessage>,
    reply: oneshot::Sender<AdminResponse>,
}

impl AdminRequest {
    pub fn message(&self) -> &dyn AdminMessage {
        self.msg.as_ref()
    }

    pub fn send(self, msg: Box<dyn AdminMessage>) {
        let _ = self.reply.send(AdminResponse::Message(msg));
    }

    pub fn send_error(self, error: String) {
        let _ = self.reply.send(AdminResponse::Error(error));
    }
}

struct Registry {
    started: bool,
    messages: HashMap<String, Arc<dyn MessageMarshaller>>,
}

/// Admin HTTP server. `start` binds the listener; registration is only
/// allowed before that.
pub struct AdminServer {
    log_prefix: String,
    laddr: String,
    url_prefix: String,
    registry: Arc<Mutex<Registry>>,
    stats: Arc<AdminStats>,
    reqch: mpsc::Sender<AdminRequest>,
    read_timeout: Duration,
    write_timeout: Duration,
    shutdown: Option<watch::Sender<bool>>,
    local_addr: Option<SocketAddr>,
}

#[derive(Clone)]
struct HttpState {
    log_prefix: String,
    registry: Arc<Mutex<Registry>>,
    stats: Arc<AdminStats>,
    reqch: mpsc::Sender<AdminRequest>,
    stats_prefix: String,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl AdminServer {
    pub fn new(
        name: &str,
        laddr: &str,
        url_prefix: &str,
        reqch: mpsc::Sender<AdminRequest>,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Self {
        Self {
            log_prefix: format!("[{name}:{laddr}]"),
            laddr: laddr.to_string(),
            url_prefix: url_prefix.to_string(),
            registry: Arc::new(Mutex::new(Registry {
                started: false,
                messages: HashMap::new(),
            })),
            stats: Arc::new(AdminStats::new(url_prefix)),
            reqch,
            read_timeout,
            write_timeout,
            shutdown: None,
            local_addr: None,
        }
    }

    fn url(&self, name: &str) -> String {
        format!("{}{name}", self.url_prefix)
    }

    /// Bind `name` to a marshaller. Fails once the server has started.
    pub fn register(&self, marshaller: Arc<dyn MessageMarshaller>) -> Result<(), AdminError> {
        let mut registry = self.registry.lock().unwrap();
        if registry.started {
            return Err(AdminError::RegisteringRequest);
        }
        let key = self.url(marshaller.name());
        // Pre-seed the counters so registered messages appear in the
        // snapshot before any traffic.
        self.stats.path(&format!("request.{}", marshaller.name()));
        tracing::info!(prefix = %self.log_prefix, url = %key, "registered");
        registry.messages.insert(key, marshaller);
        Ok(())
    }

    /// Remove a registered name. Fails once the server has started.
    pub fn unregister(&self, name: &str) -> Result<(), AdminError> {
        let mut registry = self.registry.lock().unwrap();
        if registry.started {
            return Err(AdminError::RegisteringRequest);
        }
        let key = self.url(name);
        if registry.messages.remove(&key).is_none() {
            return Err(AdminError::MessageUnknown);
        }
        tracing::info!(prefix = %self.log_prefix, url = %key, "unregistered");
        Ok(())
    }

    pub fn registered_count(&self) -> usize {
        self.registry.lock().unwrap().messages.len()
    }

    pub fn stats_snapshot(&self) -> AdminStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub async fn start(&mut self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.laddr).await?;
        self.local_addr = Some(listener.local_addr()?);
        self.registry.lock().unwrap().started = true;

        let state = HttpState {
            log_prefix: self.log_prefix.clone(),
            registry: self.registry.clone(),
            stats: self.stats.clone(),
            reqch: self.reqch.clone(),
            stats_prefix: self.url("stats"),
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
        };
        let app = Router::new().fallback(dispatch).with_state(state);

        let (tx, mut rx) = watch::channel(false);
        self.shutdown = Some(tx);
        let log_prefix = self.log_prefix.clone();
        tokio::spawn(async move {
            tracing::info!(prefix = %log_prefix, "admin server starting");
            let shutdown = async move {
                let _ = rx.changed().await;
            };
            if let Err(err) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!(prefix = %log_prefix, error = ?err, "admin server failed");
            }
        });
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        self.registry.lock().unwrap().started = false;
        tracing::info!(prefix = %self.log_prefix, "admin server stopped");
    }
}

async fn dispatch(State(state): State<HttpState>, req: Request) -> Response {
    let path = req.uri().path().to_string();
    tracing::debug!(prefix = %state.log_prefix, path = %path, "admin request");

    // Fault containment: a panicking handler is logged and counted, never
    // propagated to the listener.
    let fut = std::panic::AssertUnwindSafe(dispatch_inner(state.clone(), path.clone(), req));
    match fut.catch_unwind().await {
        Ok(resp) => resp,
        Err(_) => {
            tracing::error!(prefix = %state.log_prefix, path = %path, "admin handler panicked");
            state.stats.path("request.panic").incr_error();
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string()).into_response()
        }
    }
}

async fn dispatch_inner(state: HttpState, path: String, req: Request) -> Response {
    if path.starts_with(&state.stats_prefix) {
        let counters = state.stats.path("request.stats");
        counters.incr_request();
        let snapshot = state.stats.snapshot();
        return match serde_json::to_vec(&snapshot) {
            Ok(data) => {
                counters.incr_response();
                state.stats.add_bytes_out(data.len() as u64);
                json_response(data)
            }
            Err(err) => {
                counters.incr_response();
                counters.incr_error();
                error_response(&state, &path, err.to_string())
            }
        };
    }

    let Some(marshaller) = state.registry.lock().unwrap().messages.get(&path).cloned() else {
        state.stats.path("request.unknown").incr_error();
        tracing::warn!(prefix = %state.log_prefix, path = %path, "path not found");
        return (StatusCode::NOT_FOUND, AdminError::PathNotFound.to_string()).into_response();
    };
    let counters = state.stats.path(&format!("request.{}", marshaller.name()));
    counters.incr_request();

    let body = match timeout(
        state.read_timeout,
        axum::body::to_bytes(req.into_body(), usize::MAX),
    )
    .await
    {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(err)) => {
            counters.incr_response();
            counters.incr_error();
            return error_response(&state, &path, err.to_string());
        }
        Err(_) => {
            counters.incr_response();
            counters.incr_error();
            return error_response(&state, &path, "body read timed out".to_string());
        }
    };
    state.stats.add_bytes_in(body.len() as u64);

    let msg = match marshaller.decode(&body) {
        Ok(msg) => msg,
        Err(err) => {
            counters.incr_response();
            counters.incr_error();
            return error_response(&state, &path, err.to_string());
        }
    };

    // Send and wait on the application's queue.
    let (tx, rx) = oneshot::channel();
    if state
        .reqch
        .send(AdminRequest { msg, reply: tx })
        .await
        .is_err()
    {
        counters.incr_response();
        counters.incr_error();
        return error_response(&state, &path, "application queue closed".to_string());
    }
    match timeout(state.write_timeout, rx).await {
        Ok(Ok(AdminResponse::Message(reply))) => match reply.encode() {
            Ok(data) => {
                counters.incr_response();
                state.stats.add_bytes_out(data.len() as u64);
                typed_response(reply.content_type(), data)
            }
            Err(err) => {
                counters.incr_response();
                counters.incr_error();
                error_response(&state, &path, err.to_string())
            }
        },
        Ok(Ok(AdminResponse::Error(error))) => {
            counters.incr_response();
            counters.incr_error();
            error_response(&state, &path, error)
        }
        Ok(Err(_)) => {
            counters.incr_response();
            counters.incr_error();
            error_response(&state, &path, "request dropped by application".to_string())
        }
        Err(_) => {
            counters.incr_response();
            counters.incr_error();
            error_response(&state, &path, "response timed out".to_string())
        }
    }
}

fn json_response(data: Vec<u8>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        Body::from(data),
    )
        .into_response()
}

fn typed_response(content_type: &str, data: Vec<u8>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, content_type.to_string())],
        Body::from(data),
    )
        .into_response()
}

fn error_response(state: &HttpState, path: &str, error: String) -> Response {
    tracing::error!(prefix = %state.log_prefix, path = %path, error = %error, "admin request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, error).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize)]
    struct PingRequest {
        token: u64,
    }

    impl NamedMessage for PingRequest {
        const NAME: &'static str = "ping";
    }

    fn server() -> (AdminServer, mpsc::Receiver<AdminRequest>) {
        let (tx, rx) = mpsc::channel(8);
        let server = AdminServer::new(
            "test",
            "127.0.0.1:0",
            "/adminport/",
            tx,
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        (server, rx)
    }

    #[test]
    fn register_then_unregister_leaves_registry_empty() {
        let (server, _rx) = server();
        server
            .register(Arc::new(JsonMarshaller::<PingRequest>::default()))
            .unwrap();
        assert_eq!(server.registered_count(), 1);
        server.unregister("ping").unwrap();
        assert_eq!(server.registered_count(), 0);
        assert!(matches!(
            server.unregister("ping").unwrap_err(),
            AdminError::MessageUnknown
        ));
    }

    #[tokio::test]
    async fn registration_is_refused_after_start() {
        let (mut server, _rx) = server();
        server.start().await.unwrap();
        let err = server
            .register(Arc::new(JsonMarshaller::<PingRequest>::default()))
            .unwrap_err();
        assert!(matches!(err, AdminError::RegisteringRequest));
        server.stop();
    }
}
