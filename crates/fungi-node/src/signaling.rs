//! Client side of the signaling API.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};

use fungi_core::api::{DeregisterResponse, ErrorBody, PeerInfo, RegisterRequest};
use fungi_core::record::PeerEndpoint;

#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("invalid signaling server url {0:?}")]
    InvalidUrl(String),
    #[error("signaling server unavailable: {0}")]
    Unavailable(String),
    #[error("signaling server rejected request: {0}")]
    BadRequest(String),
    #[error("signaling transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected status {0} from signaling server")]
    UnexpectedStatus(u16),
}

impl SignalingError {
    /// Whether trying the same request again later can succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            SignalingError::Unavailable(_) | SignalingError::Transport(_) => true,
            SignalingError::UnexpectedStatus(code) => *code >= 500,
            SignalingError::InvalidUrl(_) | SignalingError::BadRequest(_) => false,
        }
    }
}

#[async_trait]
pub trait SignalingApi: Send + Sync {
    /// Publish or refresh our public endpoint.
    async fn register(&self, node_id: &str, endpoint: SocketAddr) -> Result<(), SignalingError>;

    /// Active peers other than `caller_id`.
    async fn list_peers(&self, caller_id: &str) -> Result<Vec<PeerEndpoint>, SignalingError>;

    /// Remove our record. Returns whether the server still had one.
    async fn deregister(&self, node_id: &str) -> Result<bool, SignalingError>;
}

// ── HTTP ──────────────────────────────────────────────────────────────────────

pub struct HttpSignalingClient {
    base: Url,
    http: reqwest::Client,
}

impl HttpSignalingClient {
    pub fn new(server_url: &str, request_timeout: Duration) -> Result<Self, SignalingError> {
        let base = Url::parse(server_url)
            .ok()
            .filter(|u| !u.cannot_be_a_base())
            .ok_or_else(|| SignalingError::InvalidUrl(server_url.to_string()))?;
        let http = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self { base, http })
    }

    /// `{base}/api/{segments...}` with each segment percent-encoded.
    fn url(&self, segments: &[&str]) -> Result<Url, SignalingError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| SignalingError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .push("api")
            .extend(segments);
        Ok(url)
    }
}

/// Map non-2xx responses onto `SignalingError`.
async fn check(resp: reqwest::Response) -> Result<reqwest::Response, SignalingError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let detail = resp
        .json::<ErrorBody>()
        .await
        .map(|b| b.detail)
        .unwrap_or_default();
    match status {
        StatusCode::BAD_REQUEST => Err(SignalingError::BadRequest(detail)),
        StatusCode::SERVICE_UNAVAILABLE => Err(SignalingError::Unavailable(detail)),
        other => Err(SignalingError::UnexpectedStatus(other.as_u16())),
    }
}

#[async_trait]
impl SignalingApi for HttpSignalingClient {
    async fn register(&self, node_id: &str, endpoint: SocketAddr) -> Result<(), SignalingError> {
        let resp = self
            .http
            .post(self.url(&["nodes"])?)
            .json(&RegisterRequest::new(node_id, endpoint))
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }

    async fn list_peers(&self, caller_id: &str) -> Result<Vec<PeerEndpoint>, SignalingError> {
        let mut url = self.url(&["nodes"])?;
        url.query_pairs_mut().append_pair("caller_id", caller_id);

        let resp = check(self.http.get(url).send().await?).await?;
        let peers: Vec<PeerInfo> = resp.json().await?;

        Ok(peers
            .into_iter()
            .filter(|p| p.node_id != caller_id)
            .filter_map(|p| {
                let endpoint = p.endpoint();
                if endpoint.is_none() {
                    tracing::warn!(node_id = %p.node_id, ip = %p.ip, "ignoring peer with bad address");
                }
                endpoint
            })
            .collect())
    }

    async fn deregister(&self, node_id: &str) -> Result<bool, SignalingError> {
        let resp = self
            .http
            .delete(self.url(&["nodes", node_id])?)
            .send()
            .await?;
        let body: DeregisterResponse = check(resp).await?.json().await?;
        Ok(body.removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> HttpSignalingClient {
        HttpSignalingClient::new(base, Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn builds_api_urls() {
        let c = client("http://10.0.0.1:8080");
        assert_eq!(
            c.url(&["nodes"]).unwrap().as_str(),
            "http://10.0.0.1:8080/api/nodes"
        );

        let c = client("http://10.0.0.1:8080/");
        assert_eq!(
            c.url(&["nodes", "a/b"]).unwrap().as_str(),
            "http://10.0.0.1:8080/api/nodes/a%2Fb"
        );
    }

    #[test]
    fn rejects_unusable_urls() {
        assert!(matches!(
            HttpSignalingClient::new("not a url", Duration::from_secs(1)),
            Err(SignalingError::InvalidUrl(_))
        ));
        assert!(matches!(
            HttpSignalingClient::new("mailto:x@example.com", Duration::from_secs(1)),
            Err(SignalingError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_server_is_transient() {
        // Bind then drop to get a port with nothing listening.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let c = client(&format!("http://127.0.0.1:{}", port));
        let err = c.list_peers("A").await.unwrap_err();
        assert!(err.is_transient(), "{err}");
    }

    #[test]
    fn bad_request_is_not_transient() {
        assert!(!SignalingError::BadRequest("x".into()).is_transient());
        assert!(SignalingError::UnexpectedStatus(502).is_transient());
        assert!(!SignalingError::UnexpectedStatus(404).is_transient());
    }
}
