//! The stdio MCP loop.
//!
//! One task owns the transport: it reads frames, writes responses and watches
//! the shutdown token. Requests are queued to a single worker that runs them
//! strictly in arrival order, so no two tool calls ever overlap.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    codec::Frame,
    connection::ServerConn,
    context::ServerCtx,
    error::{Error, Result},
    schema::*,
    transport::{GenericDuplex, StdioTransport, StreamTransport, Transport},
};

const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

type Pending = Arc<Mutex<HashMap<RequestId, CancellationToken>>>;

/// Work for the single worker. Replies produced by the I/O loop travel the same
/// queue so every response leaves in arrival order.
enum Job {
    Request {
        request: JSONRPCRequest,
        cancel: CancellationToken,
    },
    Reply(JSONRPCMessage),
}

/// MCP server over a single connection.
pub struct Server {
    connection: Arc<dyn ServerConn>,
    tool_timeout: Duration,
    shutdown: CancellationToken,
}

impl Server {
    pub fn new<C>(connection: C) -> Self
    where
        C: ServerConn + 'static,
    {
        Self {
            connection: Arc::new(connection),
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            shutdown: CancellationToken::new(),
        }
    }

    /// Upper bound on a single `tools/call`. A call that runs over becomes an
    /// `isError` result.
    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    /// Cancelling this token cancels the in-flight call and stops the loop.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn serve_stdio(self) -> Result<()> {
        self.serve(Box::new(StdioTransport::new())).await
    }

    /// Serve using generic AsyncRead and AsyncWrite streams
    pub async fn serve_stream<R, W>(self, reader: R, writer: W) -> Result<()>
    where
        R: tokio::io::AsyncRead + Send + Sync + Unpin + 'static,
        W: tokio::io::AsyncWrite + Send + Sync + Unpin + 'static,
    {
        let duplex = GenericDuplex::new(reader, writer);
        self.serve(Box::new(StreamTransport::new(duplex))).await
    }

    /// Run until the client disconnects or the shutdown token fires.
    pub async fn serve(self, mut transport: Box<dyn Transport>) -> Result<()> {
        transport.connect().await?;
        let (mut sink, mut stream) = transport.framed()?.split();

        let pending: Pending = Arc::default();
        let (work_tx, work_rx) = mpsc::unbounded_channel::<Job>();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<JSONRPCMessage>();
        let worker = tokio::spawn(run_worker(
            self.connection.clone(),
            work_rx,
            out_tx,
            pending.clone(),
            self.tool_timeout,
        ));

        let mut work_tx = Some(work_tx);
        let mut result = Ok(());
        info!("MCP server started");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    info!("shutdown requested; cancelling outstanding requests");
                    break;
                }
                outgoing = out_rx.recv() => match outgoing {
                    Some(message) => {
                        if let Err(e) = sink.send(message).await {
                            error!("failed to write response: {e}");
                            result = Err(e);
                            break;
                        }
                    }
                    // The worker only exits once the input side has closed
                    // and every queued request has been answered.
                    None => break,
                },
                frame = stream.next(), if work_tx.is_some() => match frame {
                    Some(Ok(Frame::Message(message))) => {
                        if let Some(tx) = &work_tx {
                            self.dispatch(message, tx, &pending);
                        }
                    }
                    Some(Ok(Frame::Invalid { id, code, reason })) => {
                        if let Some(tx) = &work_tx {
                            reply(tx, JSONRPCError::new(id, code, reason));
                        }
                    }
                    Some(Err(e)) => {
                        error!("error reading from transport: {e}");
                        work_tx = None;
                    }
                    None => {
                        info!("client disconnected");
                        work_tx = None;
                    }
                },
            }
        }

        // Child tokens of `shutdown` cover every queued and running request.
        self.shutdown.cancel();
        drop(work_tx);
        if let Err(e) = worker.await {
            error!("request worker failed: {e}");
        }
        if let Err(e) = sink.close().await {
            debug!("closing transport: {e}");
        }
        if let Err(e) = self.connection.on_shutdown().await {
            error!("error during server shutdown: {e}");
        }
        info!("MCP server stopped");
        result
    }

    fn dispatch(&self, message: JSONRPCMessage, work_tx: &mpsc::UnboundedSender<Job>, pending: &Pending) {
        match message {
            JSONRPCMessage::Request(request) => {
                let cancel = self.shutdown.child_token();
                let accepted = match pending.lock() {
                    Ok(mut pending) if !pending.contains_key(&request.id) => {
                        pending.insert(request.id.clone(), cancel.clone());
                        true
                    }
                    Ok(_) => false,
                    Err(_) => true,
                };
                if !accepted {
                    warn!(id = %request.id, "request id is already in flight");
                    reply(
                        work_tx,
                        JSONRPCError::new(
                            Some(request.id.clone()),
                            INVALID_REQUEST,
                            format!("request id {} is already in flight", request.id),
                        ),
                    );
                    return;
                }
                debug!(id = %request.id, method = %request.request.method, "queued request");
                if work_tx.send(Job::Request { request, cancel }).is_err() {
                    error!("request worker is gone; dropping request");
                }
            }
            JSONRPCMessage::Notification(notification) => {
                handle_notification(notification, pending);
            }
            JSONRPCMessage::Response(response) => {
                debug!(id = %response.id, "ignoring unsolicited response from client");
            }
            JSONRPCMessage::Error(err) => {
                warn!(
                    code = err.error.code,
                    "client reported error: {}", err.error.message
                );
            }
        }
    }
}

fn reply(work_tx: &mpsc::UnboundedSender<Job>, error: JSONRPCError) {
    if work_tx.send(Job::Reply(JSONRPCMessage::Error(error))).is_err() {
        error!("request worker is gone; dropping error response");
    }
}

async fn run_worker(
    connection: Arc<dyn ServerConn>,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    out: mpsc::UnboundedSender<JSONRPCMessage>,
    pending: Pending,
    tool_timeout: Duration,
) {
    while let Some(job) = jobs.recv().await {
        let (request, cancel) = match job {
            Job::Request { request, cancel } => (request, cancel),
            Job::Reply(message) => {
                if out.send(message).is_err() {
                    break;
                }
                continue;
            }
        };
        let id = request.id.clone();
        let outcome = if cancel.is_cancelled() {
            None
        } else {
            let ctx = ServerCtx::for_request(id.clone(), cancel.clone());
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                message = handle_request(&*connection, request, &ctx, tool_timeout) => Some(message),
            }
        };
        if let Ok(mut pending) = pending.lock() {
            pending.remove(&id);
        }

        match outcome {
            Some(message) => {
                if out.send(message).is_err() {
                    break;
                }
            }
            None => debug!(%id, "request cancelled; no response sent"),
        }
    }
}

/// Handle a request and convert the result to a JSON-RPC message
async fn handle_request(
    connection: &dyn ServerConn,
    request: JSONRPCRequest,
    ctx: &ServerCtx,
    tool_timeout: Duration,
) -> JSONRPCMessage {
    info!(id = %request.id, method = %request.request.method, "handling request");
    let id = request.id.clone();

    match handle_request_inner(connection, request, ctx, tool_timeout).await {
        Ok(value) => JSONRPCMessage::Response(JSONRPCResponse::new(id, value)),
        Err(e) => match e.to_jsonrpc_response(id.clone()) {
            Some(jsonrpc_error) => JSONRPCMessage::Error(jsonrpc_error),
            None => {
                error!("request failed: {e}");
                JSONRPCMessage::Error(JSONRPCError::new(Some(id), INTERNAL_ERROR, e.to_string()))
            }
        },
    }
}

async fn handle_request_inner(
    conn: &dyn ServerConn,
    request: JSONRPCRequest,
    ctx: &ServerCtx,
    tool_timeout: Duration,
) -> Result<Value> {
    let method = request.request.method;
    let mut request_obj = serde_json::Map::new();
    request_obj.insert("method".to_string(), Value::String(method.clone()));
    if let Some(params) = request.request.params {
        for (key, value) in params.other {
            request_obj.insert(key, value);
        }
    }

    let client_request = match serde_json::from_value::<ClientRequest>(Value::Object(request_obj))
    {
        Ok(req) => req,
        Err(err) => {
            if err.to_string().contains("unknown variant") {
                return Err(Error::MethodNotFound(method));
            }
            return Err(Error::InvalidParams(format!(
                "Invalid parameters for {method}: {err}"
            )));
        }
    };

    match client_request {
        ClientRequest::Initialize {
            protocol_version,
            capabilities,
            client_info,
        } => {
            let result = conn
                .initialize(ctx, protocol_version, capabilities, client_info)
                .await?;
            Ok(serde_json::to_value(result)?)
        }
        ClientRequest::Ping => {
            conn.pong(ctx).await?;
            Ok(serde_json::json!({}))
        }
        ClientRequest::ListTools { cursor } => {
            Ok(serde_json::to_value(conn.list_tools(ctx, cursor).await?)?)
        }
        ClientRequest::CallTool { name, arguments } => {
            let result =
                match tokio::time::timeout(tool_timeout, conn.call_tool(ctx, name.clone(), arguments))
                    .await
                {
                    Ok(result) => result?,
                    Err(_) => {
                        warn!(tool = %name, ?tool_timeout, "tool call timed out");
                        CallToolResult::error(format!(
                            "tool call timed out after {}s",
                            tool_timeout.as_secs_f64()
                        ))
                    }
                };
            Ok(serde_json::to_value(result)?)
        }
    }
}

fn handle_notification(notification: JSONRPCNotification, pending: &Pending) {
    let method = notification.notification.method;
    let mut object = serde_json::Map::new();
    object.insert("method".to_string(), Value::String(method.clone()));
    if let Some(params) = notification.notification.params {
        for (k, v) in params.other {
            object.insert(k, v);
        }
    }

    match serde_json::from_value::<ClientNotification>(Value::Object(object)) {
        Ok(ClientNotification::Initialized) => debug!("client initialized"),
        Ok(ClientNotification::Cancelled { request_id, reason }) => {
            let token = pending
                .lock()
                .ok()
                .and_then(|pending| pending.get(&request_id).cloned());
            match token {
                Some(token) => {
                    info!(id = %request_id, reason = ?reason, "cancelling request");
                    token.cancel();
                }
                None => debug!(id = %request_id, "cancellation for unknown or finished request"),
            }
        }
        Err(e) => debug!(%method, "ignoring notification: {e}"),
    }
}
