//! Client handle for the central authenticate service.
//!
//! The forwarding core only constructs this and passes the session TTLs
//! through; the validate/refresh wire exchange belongs to the
//! request-authentication middleware layered above the proxy.

use std::time::Duration;

use url::Url;

#[derive(Clone)]
pub struct AuthenticateClient {
    service_url: Url,
    shared_key: String,
    session_lifetime_ttl: Duration,
    session_valid_ttl: Duration,
    grace_period_ttl: Duration,
}

impl AuthenticateClient {
    pub fn new(
        service_url: Url,
        shared_key: impl Into<String>,
        session_lifetime_ttl: Duration,
        session_valid_ttl: Duration,
        grace_period_ttl: Duration,
    ) -> Self {
        Self {
            service_url,
            shared_key: shared_key.into(),
            session_lifetime_ttl,
            session_valid_ttl,
            grace_period_ttl,
        }
    }

    pub fn service_url(&self) -> &Url {
        &self.service_url
    }

    pub fn shared_key(&self) -> &str {
        &self.shared_key
    }

    /// How long a session may live before a forced re-authentication.
    pub fn session_lifetime_ttl(&self) -> Duration {
        self.session_lifetime_ttl
    }

    /// How long a validation result is trusted before re-checking.
    pub fn session_valid_ttl(&self) -> Duration {
        self.session_valid_ttl
    }

    /// Window during which a failed revalidation is still tolerated.
    pub fn grace_period_ttl(&self) -> Duration {
        self.grace_period_ttl
    }
}
