//! The per-route forwarding pipeline.
//!
//! Order is fixed: scrub the proxy's own session cookie, attach the signed
//! identity assertion, forward through the director. The whole pipeline runs
//! under the route's deadline; exceeding it answers the client with a
//! server-generated timeout response instead of whatever the upstream
//! eventually sends.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Request, Response, StatusCode};
use tracing::warn;

use crate::modules::crypt::Signer;
use crate::proxy::config::SigningPolicy;
use crate::proxy::director::Director;

/// Signed identity assertion, attached for the upstream to verify.
pub const HEADER_JWT: &str = "x-hostgate-jwt-assertion";
/// Validated user id, set by the request-authentication middleware.
pub const HEADER_USER_ID: &str = "x-hostgate-authenticated-user-id";
/// Validated user email, set by the request-authentication middleware.
pub const HEADER_EMAIL: &str = "x-hostgate-authenticated-user-email";

pub struct UpstreamProxy {
    name: String,
    cookie_name: String,
    director: Director,
    signer: Option<Arc<dyn Signer>>,
    signing_policy: SigningPolicy,
    timeout: Duration,
}

impl UpstreamProxy {
    pub fn new(
        director: Director,
        cookie_name: impl Into<String>,
        signer: Option<Arc<dyn Signer>>,
        signing_policy: SigningPolicy,
        timeout: Duration,
    ) -> Self {
        let name = director.upstream_authority().to_string();
        Self {
            name,
            cookie_name: cookie_name.into(),
            director,
            signer,
            signing_policy,
            timeout,
        }
    }

    /// Upstream authority this route forwards to.
    pub fn upstream(&self) -> &str {
        &self.name
    }

    /// Serves one request end to end under the route's deadline.
    pub async fn serve(&self, req: Request<Body>) -> Response<Body> {
        match tokio::time::timeout(self.timeout, self.proxy(req)).await {
            Ok(response) => response,
            Err(_) => text_response(
                StatusCode::GATEWAY_TIMEOUT,
                format!(
                    "{} failed to respond within the {:?} timeout period",
                    self.name, self.timeout
                ),
            ),
        }
    }

    async fn proxy(&self, mut req: Request<Body>) -> Response<Body> {
        scrub_session_cookie(req.headers_mut(), &self.cookie_name);
        if let Err(response) = self.sign_request(req.headers_mut()) {
            return response;
        }
        match self.director.forward(req).await {
            Ok(response) => response,
            Err(err) => {
                warn!("forward to {} failed: {}", self.name, err);
                text_response(
                    StatusCode::BAD_GATEWAY,
                    format!("{} is unreachable", self.name),
                )
            }
        }
    }

    /// Attaches the assertion header when a signer is configured and the
    /// validated claim headers are present. Absent claims always forward
    /// unsigned; a signing failure forwards or rejects per the configured
    /// policy.
    fn sign_request(&self, headers: &mut HeaderMap) -> Result<(), Response<Body>> {
        let Some(signer) = &self.signer else {
            return Ok(());
        };
        let user_id = header_str(headers, HEADER_USER_ID);
        let email = header_str(headers, HEADER_EMAIL);
        let (Some(user_id), Some(email)) = (user_id, email) else {
            return Ok(());
        };
        match signer.sign(&user_id, &email) {
            Ok(token) => {
                if let Ok(value) = HeaderValue::from_str(&token) {
                    headers.insert(HEADER_JWT, value);
                }
                Ok(())
            }
            Err(err) => match self.signing_policy {
                SigningPolicy::Omit => {
                    warn!("could not sign assertion for {}: {}", self.name, err);
                    Ok(())
                }
                SigningPolicy::Reject => Err(text_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "identity assertion could not be produced".to_string(),
                )),
            },
        }
    }
}

/// Removes exactly the proxy's session cookie from the Cookie header,
/// keeping every other cookie in its original order.
pub(crate) fn scrub_session_cookie(headers: &mut HeaderMap, cookie_name: &str) {
    let Some(raw) = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
    else {
        return;
    };
    let kept: Vec<&str> = raw
        .split(';')
        .map(str::trim)
        .filter(|cookie| !cookie.is_empty())
        .filter(|cookie| cookie.split('=').next().map(str::trim) != Some(cookie_name))
        .collect();
    if kept.is_empty() {
        headers.remove(header::COOKIE);
    } else if let Ok(value) = HeaderValue::from_str(&kept.join(";")) {
        headers.insert(header::COOKIE, value);
    }
}

fn header_str(headers: &HeaderMap, name: &'static str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

pub(crate) fn text_response(status: StatusCode, body: String) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
