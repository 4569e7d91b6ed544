//! Status callback to the central record store.
//!
//! Delivery is best effort: one POST per event, no retry. Callers log the
//! error and move on.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::Uri;
use http_body_util::Full;
use thiserror::Error;
use tracing::debug;

use labvm_core::StatusEvent;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("invalid callback url {url:?}: {message}")]
    InvalidUrl { url: String, message: String },

    #[error("failed to encode status event: {0}")]
    Encode(String),

    #[error("callback connection failed: {0}")]
    Connect(String),

    #[error("callback request failed: {0}")]
    Request(String),

    #[error("callback returned HTTP {0}")]
    Status(u16),

    #[error("callback timed out after {0:?}")]
    Timeout(Duration),
}

/// Sink for workload status changes.
#[async_trait]
pub trait StatusNotifier: Send + Sync {
    async fn notify(&self, event: &StatusEvent) -> Result<(), NotifyError>;
}

/// POSTs each event as JSON to a fixed callback URL.
#[derive(Debug, Clone)]
pub struct HttpNotifier {
    /// `host:port` to connect to.
    address: String,
    /// Origin-form request target (path and query).
    target: String,
    url: String,
    timeout: Duration,
}

impl HttpNotifier {
    /// Only plain `http://` URLs are supported.
    pub fn new(callback_url: &str, timeout: Duration) -> Result<Self, NotifyError> {
        let invalid = |message: &str| NotifyError::InvalidUrl {
            url: callback_url.to_string(),
            message: message.to_string(),
        };

        let uri: Uri = callback_url.parse().map_err(|e: http::uri::InvalidUri| invalid(&e.to_string()))?;
        if uri.scheme_str() != Some("http") {
            return Err(invalid("scheme must be http"));
        }
        let authority = uri.authority().ok_or_else(|| invalid("missing host"))?;
        let address = format!("{}:{}", authority.host(), authority.port_u16().unwrap_or(80));
        let target = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        Ok(Self {
            address,
            target,
            url: callback_url.to_string(),
            timeout,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn post(&self, body: Vec<u8>) -> Result<(), NotifyError> {
        let stream = tokio::net::TcpStream::connect(&self.address)
            .await
            .map_err(|e| NotifyError::Connect(e.to_string()))?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| NotifyError::Connect(e.to_string()))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("POST")
            .uri(&self.target)
            .header("host", &self.address)
            .header("content-type", "application/json")
            .header("user-agent", "labvm-watch/0.1")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| NotifyError::Request(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| NotifyError::Request(e.to_string()))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(NotifyError::Status(resp.status().as_u16()))
        }
    }
}

#[async_trait]
impl StatusNotifier for HttpNotifier {
    async fn notify(&self, event: &StatusEvent) -> Result<(), NotifyError> {
        let body = serde_json::to_vec(event).map_err(|e| NotifyError::Encode(e.to_string()))?;

        tokio::time::timeout(self.timeout, self.post(body))
            .await
            .map_err(|_| NotifyError::Timeout(self.timeout))??;

        debug!(vm_name = %event.vm_name, status = %event.status, url = %self.url, "status callback delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::Json;
    use axum::Router;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use labvm_core::WorkloadStatus;

    use super::*;

    type Received = Arc<Mutex<Vec<serde_json::Value>>>;

    async fn record(
        State(received): State<Received>,
        Json(body): Json<serde_json::Value>,
    ) -> StatusCode {
        received.lock().unwrap().push(body);
        StatusCode::OK
    }

    async fn refuse() -> StatusCode {
        StatusCode::NOT_FOUND
    }

    /// Serve a callback endpoint on an ephemeral port.
    async fn callback_server() -> (String, Received) {
        let received: Received = Arc::default();
        let app = Router::new()
            .route("/virtualmachines/vm-status-callback", post(record))
            .route("/missing", post(refuse))
            .with_state(received.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), received)
    }

    #[tokio::test]
    async fn posts_camel_case_json() {
        let (base, received) = callback_server().await;
        let notifier = HttpNotifier::new(
            &format!("{base}/virtualmachines/vm-status-callback"),
            Duration::from_secs(2),
        )
        .unwrap();

        let event = StatusEvent::now("vm-abc", WorkloadStatus::Running, "");
        notifier.notify(&event).await.unwrap();

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0]["vmName"], "vm-abc");
        assert_eq!(received[0]["status"], "running");
        assert_eq!(received[0]["message"], "");
        assert!(received[0]["timestamp"].is_string());
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let (base, _) = callback_server().await;
        let notifier = HttpNotifier::new(&format!("{base}/missing"), Duration::from_secs(2)).unwrap();

        let err = notifier
            .notify(&StatusEvent::now("vm-abc", WorkloadStatus::Error, "boom"))
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::Status(404)));
    }

    #[tokio::test]
    async fn closed_port_is_a_connect_error() {
        let notifier =
            HttpNotifier::new("http://127.0.0.1:1/callback", Duration::from_secs(2)).unwrap();
        let err = notifier
            .notify(&StatusEvent::now("vm-abc", WorkloadStatus::Running, ""))
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::Connect(_)));
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        // Accepts connections but never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let notifier =
            HttpNotifier::new(&format!("http://{addr}/cb"), Duration::from_millis(200)).unwrap();
        let err = notifier
            .notify(&StatusEvent::now("vm-abc", WorkloadStatus::Running, ""))
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::Timeout(_)));
    }

    #[test]
    fn url_parsing() {
        let n = HttpNotifier::new("http://records:8888/vm/cb?x=1", Duration::from_secs(1)).unwrap();
        assert_eq!(n.address, "records:8888");
        assert_eq!(n.target, "/vm/cb?x=1");

        let n = HttpNotifier::new("http://records", Duration::from_secs(1)).unwrap();
        assert_eq!(n.address, "records:80");
        assert_eq!(n.target, "/");

        assert!(HttpNotifier::new("https://records/cb", Duration::from_secs(1)).is_err());
        assert!(HttpNotifier::new("not a url", Duration::from_secs(1)).is_err());
    }
}
