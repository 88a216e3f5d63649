use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{extract::Query, response::Html, routing::get, Router};
use serde::Deserialize;
use tokio::{
    sync::{oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Hard ceiling on how long a login waits for the browser.
pub const CALLBACK_TIMEOUT: Duration = Duration::from_secs(300);

/// Query parameters of the redirect back from `/authorize`.
#[derive(Deserialize, Default)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl std::fmt::Debug for CallbackParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackParams")
            .field("code", &self.code.as_ref().map(|_| "[REDACTED]"))
            .field("state", &self.state.as_ref().map(|_| "[REDACTED]"))
            .field("error", &self.error)
            .field("error_description", &self.error_description)
            .finish()
    }
}

/// A one-shot HTTP listener on a random loopback port.
///
/// Only the first request to `/` is accepted. The port is released when the
/// callback arrives, when [`CallbackListener::wait`] times out, or when the
/// listener is dropped.
pub struct CallbackListener {
    addr: SocketAddr,
    rx: Option<oneshot::Receiver<CallbackParams>>,
    shutdown: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<()>>,
}

impl CallbackListener {
    pub async fn bind() -> Result<Self> {
        let (tx, rx) = oneshot::channel::<CallbackParams>();
        let tx = Arc::new(Mutex::new(Some(tx)));

        let callback_handler = {
            let tx = tx.clone();
            move |Query(params): Query<CallbackParams>| {
                let tx = tx.clone();
                async move {
                    match tx.lock().await.take() {
                        Some(sender) => {
                            let _ = sender.send(params);
                            Html(DONE_HTML)
                        }
                        None => Html(ALREADY_HANDLED_HTML),
                    }
                }
            }
        };

        let app = Router::new().route("/", get(callback_handler));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| Error::Transport(format!("cannot bind loopback listener: {e}")))?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = served {
                warn!("callback listener stopped: {e}");
            }
        });
        debug!(%addr, "callback listener bound");

        Ok(Self {
            addr,
            rx: Some(rx),
            shutdown: Some(shutdown_tx),
            server: Some(server),
        })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// The exact URI registered in the authorization request.
    pub fn redirect_uri(&self) -> String {
        format!("http://127.0.0.1:{}/", self.port())
    }

    /// Wait for the single callback, then stop listening.
    pub async fn wait(mut self, timeout: Duration) -> Result<CallbackParams> {
        let rx = self
            .rx
            .take()
            .ok_or_else(|| Error::InternalError("callback already consumed".into()))?;
        let outcome = tokio::time::timeout(timeout, rx).await;
        self.close().await;
        match outcome {
            Ok(Ok(params)) => Ok(params),
            Ok(Err(_)) => Err(Error::MalformedCallback(
                "callback listener closed before a request arrived".into(),
            )),
            Err(_) => Err(Error::CallbackTimeout(timeout)),
        }
    }

    /// Graceful stop so the browser still receives its page, bounded so a
    /// stuck connection cannot hold the port.
    async fn close(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(mut server) = self.server.take() {
            if tokio::time::timeout(Duration::from_secs(2), &mut server)
                .await
                .is_err()
            {
                server.abort();
            }
        }
        debug!(addr = %self.addr, "callback listener closed");
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(server) = self.server.take() {
            server.abort();
        }
    }
}

const DONE_HTML: &str = r#"<!DOCTYPE html>
<html>
<head><title>bugdesk sign-in</title></head>
<body style="font-family: sans-serif; text-align: center; margin-top: 4rem;">
    <h1>Sign-in response received</h1>
    <p>You can close this window and return to your terminal.</p>
</body>
</html>"#;

const ALREADY_HANDLED_HTML: &str = r#"<!DOCTYPE html>
<html>
<head><title>bugdesk sign-in</title></head>
<body style="font-family: sans-serif; text-align: center; margin-top: 4rem;">
    <h1>This sign-in attempt has already completed</h1>
</body>
</html>"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_receives_code_and_state() {
        let listener = CallbackListener::bind().await.unwrap();
        let uri = format!("{}?code=AUTH123&state=S1", listener.redirect_uri());
        let request = tokio::spawn(async move { reqwest::get(uri).await });

        let params = listener.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(params.code.as_deref(), Some("AUTH123"));
        assert_eq!(params.state.as_deref(), Some("S1"));
        assert!(params.error.is_none());

        let response = request.await.unwrap().unwrap();
        assert!(response.status().is_success());
    }

    #[tokio::test]
    async fn test_error_parameters() {
        let listener = CallbackListener::bind().await.unwrap();
        let uri = format!(
            "{}?error=access_denied&error_description=user+declined&state=S1",
            listener.redirect_uri()
        );
        tokio::spawn(async move {
            let _ = reqwest::get(uri).await;
        });
        let params = listener.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(params.error.as_deref(), Some("access_denied"));
        assert_eq!(params.error_description.as_deref(), Some("user declined"));
        assert!(params.code.is_none());
    }

    #[tokio::test]
    async fn test_timeout_releases_port() {
        let listener = CallbackListener::bind().await.unwrap();
        let port = listener.port();
        let err = listener.wait(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, Error::CallbackTimeout(_)));
        tokio::net::TcpListener::bind(("127.0.0.1", port))
            .await
            .expect("port should be free after timeout");
    }

    #[tokio::test]
    async fn test_drop_releases_port() {
        let listener = CallbackListener::bind().await.unwrap();
        let port = listener.port();
        drop(listener);
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        tokio::net::TcpListener::bind(("127.0.0.1", port))
            .await
            .expect("port should be free after drop");
    }

    #[test]
    fn test_debug_redacts_code_and_state() {
        let params = CallbackParams {
            code: Some("AUTH123".into()),
            state: Some("S1".into()),
            ..Default::default()
        };
        let debug = format!("{params:?}");
        assert!(!debug.contains("AUTH123"));
        assert!(!debug.contains("S1"));
    }
}
