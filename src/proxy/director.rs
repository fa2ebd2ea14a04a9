//! Per-route request rewriting and the shared outbound connection pool.
//!
//! Every route forwards through one process-wide `reqwest::Client`; idle
//! connections are bounded and reused across requests to the same upstream.

use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request, Response, Uri};
use once_cell::sync::Lazy;
use reqwest::Client;
use thiserror::Error;
use url::Url;

use crate::proxy::config::url_authority;

/// Original inbound host, recorded before the request is rewritten.
pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

static UPSTREAM_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .tcp_keepalive(Duration::from_secs(30))
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
        .expect("failed to build upstream http client")
});

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("could not read request body: {0}")]
    Body(axum::Error),
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
}

/// Rewrites requests against one upstream origin. Holds no mutable state;
/// shared read-only across every request to its route.
pub struct Director {
    scheme: String,
    authority: String,
}

impl Director {
    pub fn new(to: Url) -> Self {
        let authority = url_authority(&to).unwrap_or_default();
        Self {
            scheme: to.scheme().to_string(),
            authority,
        }
    }

    /// `host[:port]` the upstream is addressed by.
    pub fn upstream_authority(&self) -> &str {
        &self.authority
    }

    /// Records the inbound host in `X-Forwarded-Host`, retargets the request
    /// at the upstream origin, and forwards it over the shared pool. The
    /// response is buffered so the caller's deadline covers the full exchange.
    pub async fn forward(&self, req: Request<Body>) -> Result<Response<Body>, ForwardError> {
        let (parts, body) = req.into_parts();
        let original_host = host_of(&parts.headers, &parts.uri);
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let target = format!("{}://{}{}", self.scheme, self.authority, path_and_query);

        let mut headers = HeaderMap::with_capacity(parts.headers.len() + 1);
        for (name, value) in parts.headers.iter() {
            if name == header::HOST || is_hop_by_hop(name.as_str()) {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
        if let Some(host) = original_host {
            if let Ok(value) = HeaderValue::from_str(&host) {
                headers.append(X_FORWARDED_HOST, value);
            }
        }

        let body = axum::body::to_bytes(body, usize::MAX)
            .await
            .map_err(ForwardError::Body)?;

        let upstream = UPSTREAM_CLIENT
            .request(parts.method, target)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = upstream.status();
        let response_headers = upstream.headers().clone();
        let bytes = upstream.bytes().await?;

        let mut response = Response::new(Body::from(bytes));
        *response.status_mut() = status;
        for (name, value) in response_headers.iter() {
            if is_hop_by_hop(name.as_str()) {
                continue;
            }
            response.headers_mut().append(name.clone(), value.clone());
        }
        Ok(response)
    }
}

/// Host the client addressed: the Host header, or the URI authority on h2.
pub(crate) fn host_of(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    if let Some(value) = headers.get(header::HOST).and_then(|v| v.to_str().ok()) {
        return Some(value.to_string());
    }
    uri.authority().map(|a| a.as_str().to_string())
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
