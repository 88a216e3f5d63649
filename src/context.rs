use tokio_util::sync::CancellationToken;

use crate::schema::RequestId;

/// Per-request context handed to [`ServerConn`](crate::connection::ServerConn)
/// methods.
#[derive(Debug, Clone, Default)]
pub struct ServerCtx {
    request_id: Option<RequestId>,
    cancellation: CancellationToken,
}

impl ServerCtx {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn for_request(request_id: RequestId, cancellation: CancellationToken) -> Self {
        Self {
            request_id: Some(request_id),
            cancellation,
        }
    }

    pub fn request_id(&self) -> Option<&RequestId> {
        self.request_id.as_ref()
    }

    /// Fires when the client cancels this request or the server shuts down.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}
