//! Cookie-backed session and CSRF storage.
//!
//! One store instance is shared by every route. The forwarding pipeline only
//! constructs it; the authentication flow layered above the proxy is what
//! reads and writes through it. Values are sealed by the cookie cipher before
//! they reach the client.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderMap, HeaderValue};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::modules::crypt::{Cipher, CryptError};

/// Binds a cross-service redirect to the session that initiated it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateParameter {
    pub session_id: String,
    pub redirect_uri: String,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Crypt(#[from] CryptError),
    #[error("could not marshal session state: {0}")]
    Marshal(#[from] serde_json::Error),
    #[error("cookie attributes produce an invalid header value")]
    CookieValue,
}

pub struct CookieStore {
    name: String,
    cipher: Arc<dyn Cipher>,
    domain: String,
    expire: Duration,
    http_only: bool,
}

impl CookieStore {
    pub fn new(name: impl Into<String>, cipher: Arc<dyn Cipher>) -> Self {
        Self {
            name: name.into(),
            cipher,
            domain: String::new(),
            expire: Duration::from_secs(168 * 3600),
            http_only: false,
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn with_expire(mut self, expire: Duration) -> Self {
        self.expire = expire;
        self
    }

    pub fn with_http_only(mut self, http_only: bool) -> Self {
        self.http_only = http_only;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn seal(&self, value: &[u8]) -> Result<String, CryptError> {
        Ok(URL_SAFE_NO_PAD.encode(self.cipher.encrypt(value)?))
    }

    fn open(&self, value: &str) -> Option<Vec<u8>> {
        let raw = URL_SAFE_NO_PAD.decode(value).ok()?;
        self.cipher.decrypt(&raw).ok()
    }

    fn set_cookie(&self, headers: &mut HeaderMap, name: &str, value: &str, max_age: u64) -> Result<(), SessionError> {
        let mut cookie = format!("{}={}; Path=/; Max-Age={}", name, value, max_age);
        if !self.domain.is_empty() {
            cookie.push_str("; Domain=");
            cookie.push_str(&self.domain);
        }
        if self.http_only {
            cookie.push_str("; HttpOnly");
        }
        cookie.push_str("; Secure");
        let value = HeaderValue::from_str(&cookie).map_err(|_| SessionError::CookieValue)?;
        headers.append(header::SET_COOKIE, value);
        Ok(())
    }

    fn cookie_value(&self, headers: &HeaderMap, name: &str) -> Option<String> {
        let raw = headers.get(header::COOKIE)?.to_str().ok()?;
        for cookie in raw.split(';') {
            let cookie = cookie.trim();
            if let Some(value) = cookie.strip_prefix(&format!("{}=", name)) {
                return Some(value.to_string());
            }
        }
        None
    }

    /// Seals `value` into the session cookie on the response headers.
    pub fn save_session(&self, headers: &mut HeaderMap, value: &[u8]) -> Result<(), SessionError> {
        let sealed = self.seal(value)?;
        self.set_cookie(headers, &self.name, &sealed, self.expire.as_secs())
    }

    /// Opens the session cookie from the request headers. `None` covers both
    /// an absent cookie and one that fails authentication on decrypt.
    pub fn load_session(&self, headers: &HeaderMap) -> Option<Vec<u8>> {
        let value = self.cookie_value(headers, &self.name)?;
        self.open(&value)
    }

    pub fn clear_session(&self, headers: &mut HeaderMap) -> Result<(), SessionError> {
        self.set_cookie(headers, &self.name, "", 0)
    }

    fn csrf_name(&self) -> String {
        format!("{}_csrf", self.name)
    }

    /// Seals the redirect-binding state parameter into the CSRF cookie.
    pub fn save_csrf(&self, headers: &mut HeaderMap, state: &StateParameter) -> Result<(), SessionError> {
        let raw = serde_json::to_vec(state)?;
        let sealed = self.seal(&raw)?;
        self.set_cookie(headers, &self.csrf_name(), &sealed, self.expire.as_secs())
    }

    pub fn load_csrf(&self, headers: &HeaderMap) -> Option<StateParameter> {
        let value = self.cookie_value(headers, &self.csrf_name())?;
        let raw = self.open(&value)?;
        serde_json::from_slice(&raw).ok()
    }

    pub fn clear_csrf(&self, headers: &mut HeaderMap) -> Result<(), SessionError> {
        self.set_cookie(headers, &self.csrf_name(), "", 0)
    }
}
