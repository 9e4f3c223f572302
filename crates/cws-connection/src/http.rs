//! Thin HTTP/1 client used by the health probes and retry wrappers.
//!
//! Both `http` and `https` URLs are accepted; TLS goes through the
//! platform's native stack.
//!
//! Requests are taken as `http::Request<Bytes>` so they can be re-sent on
//! retry; responses are fully buffered into `http::Response<Bytes>`.

use std::time::Duration;

use bytes::Bytes;
use http::{Method, Request, Response};
use http_body_util::{BodyExt, Full};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ConnectionError, Result};

const USER_AGENT: &str = concat!("cws-connection/", env!("CARGO_PKG_VERSION"));

/// Pooled HTTP client with a per-request timeout.
#[derive(Clone)]
pub struct HttpClient {
    inner: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    timeout: Duration,
}

impl HttpClient {
    /// Create a client whose requests (headers and body) must complete
    /// within `timeout`.
    pub fn new(timeout: Duration) -> Self {
        let mut http = HttpConnector::new();
        http.set_connect_timeout(Some(timeout));
        http.enforce_http(false);

        let inner = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(2)
            .build(HttpsConnector::new_with_connector(http));

        Self { inner, timeout }
    }

    /// Per-request timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send a GET to `url`.
    pub async fn get(&self, url: &str, cancel: &CancellationToken) -> Result<Response<Bytes>> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(url)
            .body(Bytes::new())
            .map_err(|e| ConnectionError::InvalidRequest(format!("{url}: {e}")))?;
        self.send(&request, cancel).await
    }

    /// Send a copy of `request`. Only transport failures are errors; any
    /// HTTP status is returned as a response.
    pub async fn send(
        &self,
        request: &Request<Bytes>,
        cancel: &CancellationToken,
    ) -> Result<Response<Bytes>> {
        let url = request.uri().to_string();
        let outgoing = duplicate(request);

        let exchange_url = url.clone();
        let exchange = async move {
            let response = self
                .inner
                .request(outgoing)
                .await
                .map_err(|e| ConnectionError::Http {
                    url: exchange_url.clone(),
                    source: Box::new(e),
                })?;
            let (parts, body) = response.into_parts();
            let body = body
                .collect()
                .await
                .map_err(|e| ConnectionError::Http {
                    url: exchange_url,
                    source: Box::new(e),
                })?
                .to_bytes();
            Ok::<_, ConnectionError>(Response::from_parts(parts, body))
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ConnectionError::cancelled(format!("HTTP request to {url}"))),
            result = tokio::time::timeout(self.timeout, exchange) => match result {
                Ok(Ok(response)) => {
                    debug!(%url, status = %response.status(), "HTTP exchange complete");
                    Ok(response)
                }
                Ok(Err(e)) => Err(e),
                Err(_) => Err(ConnectionError::RequestTimeout {
                    url,
                    timeout: self.timeout,
                }),
            },
        }
    }
}

/// Clone a buffered request into a hyper request.
fn duplicate(request: &Request<Bytes>) -> Request<Full<Bytes>> {
    let mut out = Request::new(Full::new(request.body().clone()));
    *out.method_mut() = request.method().clone();
    *out.uri_mut() = request.uri().clone();
    *out.version_mut() = request.version();
    *out.headers_mut() = request.headers().clone();
    if !out.headers().contains_key(http::header::USER_AGENT) {
        out.headers_mut().insert(
            http::header::USER_AGENT,
            http::HeaderValue::from_static(USER_AGENT),
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::{get, post};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn get_returns_any_status() {
        let base = serve(
            Router::new()
                .route("/ok", get(|| async { "fine" }))
                .route("/broken", get(|| async { StatusCode::INTERNAL_SERVER_ERROR })),
        )
        .await;
        let client = HttpClient::new(Duration::from_secs(5));
        let cancel = CancellationToken::new();

        let ok = client.get(&format!("{base}/ok"), &cancel).await.unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(ok.body().as_ref(), b"fine");

        let broken = client.get(&format!("{base}/broken"), &cancel).await.unwrap();
        assert_eq!(broken.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn send_can_be_repeated() {
        let base = serve(Router::new().route("/echo", post(|body: String| async move { body }))).await;
        let client = HttpClient::new(Duration::from_secs(5));
        let cancel = CancellationToken::new();

        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("{base}/echo"))
            .body(Bytes::from_static(b"ping"))
            .unwrap();

        for _ in 0..2 {
            let resp = client.send(&request, &cancel).await.unwrap();
            assert_eq!(resp.body().as_ref(), b"ping");
        }
    }

    #[tokio::test]
    async fn closed_port_is_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = HttpClient::new(Duration::from_secs(2));
        let err = client
            .get(&format!("http://127.0.0.1:{port}/"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_transport(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn https_urls_reach_the_socket() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted_tx, accepted_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            // Plain TCP: accept, then hang up mid-handshake.
            let (stream, _) = listener.accept().await.unwrap();
            let _ = accepted_tx.send(());
            drop(stream);
        });

        let client = HttpClient::new(Duration::from_secs(2));
        let err = client
            .get(&format!("https://{addr}/"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_transport(), "unexpected error: {err}");
        tokio::time::timeout(Duration::from_secs(1), accepted_rx)
            .await
            .expect("no TCP connection was made for the https URL")
            .unwrap();
    }

    #[tokio::test]
    async fn cancelled_token_aborts() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let client = HttpClient::new(Duration::from_secs(2));
        let err = client.get("http://127.0.0.1:9/", &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn invalid_url_is_rejected() {
        let client = HttpClient::new(Duration::from_secs(1));
        let err = client
            .get("not a url", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidRequest(_)));
    }

    #[test]
    fn duplicate_sets_user_agent() {
        let request = Request::builder()
            .uri("http://localhost/")
            .body(Bytes::new())
            .unwrap();
        let out = duplicate(&request);
        assert_eq!(out.headers()[http::header::USER_AGENT], USER_AGENT);
        assert_eq!(out.method(), Method::GET);
    }
}
