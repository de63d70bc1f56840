//! Host side of the protocol: what a plugin host process links against to
//! talk to the supervisor that launched it.
//!
//! A host parses [`HostArgs`], connects its event channel, and hands a
//! [`ControlHandler`] to [`serve`]. `serve` announces `host-registered` and
//! then answers control requests until `shutdown` or end of input.

use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::{Result, TransportError};
use crate::protocol::{
    error_codes, ControlRequest, HostEvent, JsonRpcMessage, JsonRpcResponse, JsonRpcV2Message,
};
use crate::transport::{Connection, EventSender, LineConnection};

/// Identity flags the supervisor appends to every host command line.
#[derive(Debug, Clone, clap::Args)]
pub struct HostArgs {
    #[arg(long)]
    pub plugin_id: String,

    #[arg(long)]
    pub host_token: String,

    #[arg(long)]
    pub event_endpoint: PathBuf,
}

/// Where a host's events go.
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    async fn emit(&self, event: &HostEvent) -> Result<()>;
}

#[async_trait]
impl EventSink for EventSender {
    async fn emit(&self, event: &HostEvent) -> Result<()> {
        self.send(event).await
    }
}

#[async_trait]
impl EventSink for mpsc::UnboundedSender<HostEvent> {
    async fn emit(&self, event: &HostEvent) -> Result<()> {
        self.send(event.clone())
            .map_err(|_| TransportError::Closed.into())
    }
}

/// Error a handler answers a request with.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerError {
    pub code: i64,
    pub message: String,
}

impl HandlerError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(error_codes::INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(error_codes::INTERNAL_ERROR, message)
    }
}

pub type HandlerResult = std::result::Result<Value, HandlerError>;

/// Identity of a running host plus its event channel.
#[derive(Clone)]
pub struct HostContext {
    plugin_id: String,
    token: String,
    process_id: u32,
    events: Arc<dyn EventSink>,
}

impl HostContext {
    pub fn new(
        plugin_id: impl Into<String>,
        token: impl Into<String>,
        process_id: u32,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            token: token.into(),
            process_id,
            events,
        }
    }

    /// Context for the current process from its command-line identity.
    pub async fn connect(args: &HostArgs) -> Result<Self> {
        let sender = EventSender::connect(&args.event_endpoint).await?;
        Ok(Self::new(
            args.plugin_id.clone(),
            args.host_token.clone(),
            std::process::id(),
            Arc::new(sender),
        ))
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    pub async fn announce(&self) -> Result<()> {
        self.events
            .emit(&HostEvent::HostRegistered {
                token: self.token.clone(),
                process_id: self.process_id,
            })
            .await
    }

    /// Confirm a session the supervisor asked this host to open.
    pub async fn register_session(&self, session_id: &str) -> Result<()> {
        self.events
            .emit(&HostEvent::SessionRegistered {
                token: self.token.clone(),
                process_id: self.process_id,
                session_id: session_id.to_string(),
            })
            .await
    }

    pub async fn invalidate_ui_state(
        &self,
        capability_id: &str,
        session_id: Option<&str>,
        reason: Option<&str>,
    ) -> Result<()> {
        self.events
            .emit(&HostEvent::UiStateInvalidated {
                capability_id: capability_id.to_string(),
                session_id: session_id.map(str::to_string),
                view_id: None,
                reason: reason.map(str::to_string),
            })
            .await
    }
}

#[async_trait]
pub trait ControlHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: &HostContext, request: ControlRequest) -> HandlerResult;
}

/// Serve the control channel of this process over stdin/stdout.
pub async fn serve_stdio<H: ControlHandler>(handler: Arc<H>, ctx: HostContext) -> Result<()> {
    let connection: Arc<dyn Connection> =
        Arc::new(LineConnection::new(tokio::io::stdin(), tokio::io::stdout()));
    serve(handler, ctx, connection).await
}

/// Announce the host, then answer requests until `shutdown` or end of input.
///
/// Requests are handled concurrently so a slow one never stalls the rest;
/// `shutdown` is answered inline before returning.
pub async fn serve<H: ControlHandler>(
    handler: Arc<H>,
    ctx: HostContext,
    connection: Arc<dyn Connection>,
) -> Result<()> {
    ctx.announce().await?;
    tracing::debug!(plugin = %ctx.plugin_id, pid = ctx.process_id, "Host announced");

    loop {
        let line = match connection.recv().await {
            Ok(line) => line,
            Err(e) => {
                tracing::debug!(plugin = %ctx.plugin_id, "Control input closed: {}", e);
                return Ok(());
            }
        };

        let request = match serde_json::from_slice::<JsonRpcMessage>(&line) {
            Ok(JsonRpcMessage::V2(JsonRpcV2Message::Request(request))) => request,
            Ok(_) => {
                tracing::debug!(plugin = %ctx.plugin_id, "Ignoring non-request message");
                continue;
            }
            Err(e) => {
                tracing::warn!(plugin = %ctx.plugin_id, "Unparseable control line: {}", e);
                continue;
            }
        };

        let id = request.id.clone();
        let parsed = match ControlRequest::from_jsonrpc(&request) {
            Ok(parsed) => parsed,
            Err(e) => {
                let response = JsonRpcResponse::failure(
                    id,
                    error_codes::METHOD_NOT_FOUND,
                    format!("unsupported request '{}': {}", request.method, e),
                );
                respond(connection.as_ref(), response).await?;
                continue;
            }
        };

        if matches!(parsed, ControlRequest::Shutdown) {
            let response = to_response(id, handler.handle(&ctx, parsed).await);
            if let Err(e) = respond(connection.as_ref(), response).await {
                tracing::debug!(plugin = %ctx.plugin_id, "Failed to acknowledge shutdown: {}", e);
            }
            tracing::info!(plugin = %ctx.plugin_id, "Shutdown requested");
            return Ok(());
        }

        let handler = handler.clone();
        let ctx = ctx.clone();
        let connection = connection.clone();
        tokio::spawn(async move {
            let response = to_response(id, handler.handle(&ctx, parsed).await);
            if let Err(e) = respond(connection.as_ref(), response).await {
                tracing::debug!(plugin = %ctx.plugin_id, "Failed to send response: {}", e);
            }
        });
    }
}

fn to_response(id: crate::protocol::JsonRpcId, result: HandlerResult) -> JsonRpcResponse {
    match result {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(e) => JsonRpcResponse::failure(id, e.code, e.message),
    }
}

async fn respond(connection: &dyn Connection, response: JsonRpcResponse) -> Result<()> {
    let line = JsonRpcMessage::response(response).to_line()?;
    connection.send(line).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlClient;
    use crate::error::ControlError;
    use serde_json::json;
    use std::time::Duration;

    struct EchoHandler;

    #[async_trait]
    impl ControlHandler for EchoHandler {
        async fn handle(&self, ctx: &HostContext, request: ControlRequest) -> HandlerResult {
            match request {
                ControlRequest::Ping => Ok(json!({})),
                ControlRequest::Connect { session_id, .. } => {
                    ctx.register_session(&session_id)
                        .await
                        .map_err(|e| HandlerError::internal(e.to_string()))?;
                    Ok(json!({ "sessionId": session_id }))
                }
                ControlRequest::Shutdown => Ok(json!({})),
                other => Err(HandlerError::new(
                    error_codes::METHOD_NOT_FOUND,
                    other.method_name(),
                )),
            }
        }
    }

    fn wire() -> (Arc<dyn Connection>, Arc<dyn Connection>) {
        let (host_io, supervisor_io) = tokio::io::duplex(64 * 1024);
        let (host_read, host_write) = tokio::io::split(host_io);
        let (sup_read, sup_write) = tokio::io::split(supervisor_io);
        (
            Arc::new(LineConnection::new(host_read, host_write)),
            Arc::new(LineConnection::new(sup_read, sup_write)),
        )
    }

    #[tokio::test]
    async fn test_serve_announces_and_answers() {
        let (host_conn, sup_conn) = wire();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let ctx = HostContext::new("p", "tok", 99, Arc::new(events_tx));
        let server = tokio::spawn(serve(Arc::new(EchoHandler), ctx, host_conn));

        assert_eq!(
            events.recv().await.unwrap(),
            HostEvent::HostRegistered {
                token: "tok".to_string(),
                process_id: 99
            }
        );

        let client = ControlClient::new("p", sup_conn, None);
        client.ping(Duration::from_secs(1)).await.unwrap();

        let result = client
            .connect("cap", json!({}), "s-1", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result.session_id.as_deref(), Some("s-1"));
        assert_eq!(
            events.recv().await.unwrap(),
            HostEvent::SessionRegistered {
                token: "tok".to_string(),
                process_id: 99,
                session_id: "s-1".to_string()
            }
        );

        let err = client
            .get_ui_state("cap", None, None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Remote { code, .. } if code == error_codes::METHOD_NOT_FOUND));

        client.shutdown(Duration::from_secs(1)).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_serve_returns_on_end_of_input() {
        let (host_conn, sup_conn) = wire();
        let (events_tx, _events) = mpsc::unbounded_channel();
        let ctx = HostContext::new("p", "tok", 1, Arc::new(events_tx));
        let server = tokio::spawn(serve(Arc::new(EchoHandler), ctx, host_conn));

        sup_conn.close().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_method_gets_an_error_response() {
        let (host_conn, sup_conn) = wire();
        let (events_tx, _events) = mpsc::unbounded_channel();
        let ctx = HostContext::new("p", "tok", 1, Arc::new(events_tx));
        tokio::spawn(serve(Arc::new(EchoHandler), ctx, host_conn));

        sup_conn
            .send(bytes::Bytes::from_static(
                br#"{"jsonrpc":"2.0","id":7,"method":"teleport","params":{}}"#,
            ))
            .await
            .unwrap();
        let reply = sup_conn.recv().await.unwrap();
        let JsonRpcMessage::V2(JsonRpcV2Message::Response(response)) =
            serde_json::from_slice::<JsonRpcMessage>(&reply).unwrap()
        else {
            panic!("expected a response");
        };
        assert_eq!(response.id, crate::protocol::JsonRpcId::Number(7));
        assert_eq!(response.error.unwrap().code, error_codes::METHOD_NOT_FOUND);
    }
}
