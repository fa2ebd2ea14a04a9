//! Proxy configuration: environment-sourced options and fail-fast validation.
//!
//! `Options` is built fresh per call and never mutated after validation.
//! Validation returns the first failing constraint as a specific error so
//! startup diagnostics name the offending field or route.

use std::collections::HashMap;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::modules::crypt::KEY_SIZE;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing setting: routes")]
    MissingRoutes,
    #[error("could not parse route {route} as url: {source}")]
    BadRouteUrl {
        route: String,
        source: url::ParseError,
    },
    #[error("missing setting: authenticate-service-url")]
    MissingAuthenticateUrl,
    #[error("could not parse authenticate-service-url {url} as url: {source}")]
    BadAuthenticateUrl {
        url: String,
        source: url::ParseError,
    },
    #[error("authenticate-service-url must be a valid https url")]
    InsecureAuthenticateUrl,
    #[error("missing setting: cookie-secret")]
    MissingCookieSecret,
    #[error("cookie secret is invalid base64: {0}")]
    CookieSecretEncoding(base64::DecodeError),
    #[error("cookie secret expects {KEY_SIZE} bytes but got {0}")]
    CookieSecretLength(usize),
    #[error("missing setting: shared-secret")]
    MissingSharedSecret,
    #[error("signing key is invalid base64: {0}")]
    SigningKeyEncoding(base64::DecodeError),
    #[error("invalid value for {0}: {1:?}")]
    BadSetting(&'static str, String),
}

/// What to do when a route has a signer but producing the assertion fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigningPolicy {
    /// Forward the request without the assertion header.
    #[default]
    Omit,
    /// Fail the request instead of forwarding it unsigned.
    Reject,
}

/// Configuration for the proxy service. Immutable once validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Options {
    /// The central authenticate service. Must be https.
    pub authenticate_service_url: Option<Url>,

    /// Base64 PKCS#8 ECDSA P-256 private key enabling signed identity
    /// assertions on forwarded requests. Empty disables signing.
    pub signing_key: String,
    /// Secret authenticating calls to the authenticate service.
    pub shared_secret: String,

    pub default_upstream_timeout: Duration,

    pub cookie_name: String,
    /// Base64 of exactly 32 random bytes; seeds the cookie cipher.
    pub cookie_secret: String,
    pub cookie_domain: String,
    pub cookie_expire: Duration,
    pub cookie_http_only: bool,

    pub pass_access_token: bool,

    // session details, passed through to the authenticate client
    pub session_valid_ttl: Duration,
    pub session_lifetime_ttl: Duration,
    pub grace_period_ttl: Duration,

    pub signing_policy: SigningPolicy,

    /// public host -> upstream host
    pub routes: HashMap<String, String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            authenticate_service_url: None,
            signing_key: String::new(),
            shared_secret: String::new(),
            default_upstream_timeout: Duration::from_secs(10),
            cookie_name: "_hostgate_proxy".to_string(),
            cookie_secret: String::new(),
            cookie_domain: String::new(),
            cookie_expire: Duration::from_secs(168 * 3600),
            cookie_http_only: false,
            pass_access_token: false,
            session_valid_ttl: Duration::from_secs(60),
            session_lifetime_ttl: Duration::from_secs(720 * 3600),
            grace_period_ttl: Duration::from_secs(3 * 3600),
            signing_policy: SigningPolicy::default(),
            routes: HashMap::new(),
        }
    }
}

impl Options {
    /// Builds a fresh options value from defaults plus `HOSTGATE_*`
    /// environment overrides. Never touches shared state.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut opts = Options::default();

        if let Ok(value) = std::env::var("HOSTGATE_AUTHENTICATE_SERVICE_URL") {
            let parsed = url_parse(&value).map_err(|source| ConfigError::BadAuthenticateUrl {
                url: value.clone(),
                source,
            })?;
            opts.authenticate_service_url = Some(parsed);
        }
        if let Ok(value) = std::env::var("HOSTGATE_SIGNING_KEY") {
            opts.signing_key = value;
        }
        if let Ok(value) = std::env::var("HOSTGATE_SHARED_SECRET") {
            opts.shared_secret = value;
        }
        if let Ok(value) = std::env::var("HOSTGATE_COOKIE_NAME") {
            opts.cookie_name = value;
        }
        if let Ok(value) = std::env::var("HOSTGATE_COOKIE_SECRET") {
            opts.cookie_secret = value;
        }
        if let Ok(value) = std::env::var("HOSTGATE_COOKIE_DOMAIN") {
            opts.cookie_domain = value;
        }
        if let Ok(value) = std::env::var("HOSTGATE_COOKIE_HTTP_ONLY") {
            opts.cookie_http_only = env_bool(&value);
        }
        if let Ok(value) = std::env::var("HOSTGATE_PASS_ACCESS_TOKEN") {
            opts.pass_access_token = env_bool(&value);
        }
        if let Ok(value) = std::env::var("HOSTGATE_SIGNING_POLICY") {
            opts.signing_policy = match value.as_str() {
                "omit" => SigningPolicy::Omit,
                "reject" => SigningPolicy::Reject,
                _ => return Err(ConfigError::BadSetting("HOSTGATE_SIGNING_POLICY", value)),
            };
        }

        env_duration_secs(
            "HOSTGATE_DEFAULT_UPSTREAM_TIMEOUT",
            &mut opts.default_upstream_timeout,
        )?;
        env_duration_secs("HOSTGATE_COOKIE_EXPIRE", &mut opts.cookie_expire)?;
        env_duration_secs("HOSTGATE_SESSION_VALID_TTL", &mut opts.session_valid_ttl)?;
        env_duration_secs("HOSTGATE_SESSION_LIFETIME_TTL", &mut opts.session_lifetime_ttl)?;
        env_duration_secs("HOSTGATE_GRACE_PERIOD_TTL", &mut opts.grace_period_ttl)?;

        if let Ok(value) = std::env::var("HOSTGATE_ROUTES") {
            opts.routes = parse_routes(&value)?;
        }

        Ok(opts)
    }

    /// Checks every startup constraint, returning the first failure. Safe to
    /// call repeatedly; takes `&self` and mutates nothing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.routes.is_empty() {
            return Err(ConfigError::MissingRoutes);
        }
        for (from, to) in &self.routes {
            url_parse(from).map_err(|source| ConfigError::BadRouteUrl {
                route: from.clone(),
                source,
            })?;
            url_parse(to).map_err(|source| ConfigError::BadRouteUrl {
                route: to.clone(),
                source,
            })?;
        }
        let auth_url = self
            .authenticate_service_url
            .as_ref()
            .ok_or(ConfigError::MissingAuthenticateUrl)?;
        if auth_url.scheme() != "https" {
            return Err(ConfigError::InsecureAuthenticateUrl);
        }
        if self.cookie_secret.is_empty() {
            return Err(ConfigError::MissingCookieSecret);
        }
        if self.shared_secret.is_empty() {
            return Err(ConfigError::MissingSharedSecret);
        }
        let decoded = BASE64
            .decode(&self.cookie_secret)
            .map_err(ConfigError::CookieSecretEncoding)?;
        if decoded.len() != KEY_SIZE {
            return Err(ConfigError::CookieSecretLength(decoded.len()));
        }
        if !self.signing_key.is_empty() {
            BASE64
                .decode(&self.signing_key)
                .map_err(ConfigError::SigningKeyEncoding)?;
        }
        Ok(())
    }
}

fn env_bool(value: &str) -> bool {
    matches!(value, "1" | "true" | "yes" | "on")
}

fn env_duration_secs(name: &'static str, into: &mut Duration) -> Result<(), ConfigError> {
    if let Ok(value) = std::env::var(name) {
        let secs: u64 = value
            .parse()
            .map_err(|_| ConfigError::BadSetting(name, value.clone()))?;
        *into = Duration::from_secs(secs);
    }
    Ok(())
}

/// `from=to` pairs separated by commas.
fn parse_routes(raw: &str) -> Result<HashMap<String, String>, ConfigError> {
    let mut routes = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (from, to) = pair
            .split_once('=')
            .ok_or_else(|| ConfigError::BadSetting("HOSTGATE_ROUTES", pair.to_string()))?;
        routes.insert(from.trim().to_string(), to.trim().to_string());
    }
    Ok(routes)
}

/// Parses `uri`, defaulting a bare hostname to the https scheme, so
/// `svc.example.com` and `https://svc.example.com` are equivalent.
pub fn url_parse(uri: &str) -> Result<Url, url::ParseError> {
    if uri.contains("://") {
        Url::parse(uri)
    } else {
        Url::parse(&format!("https://{}", uri))
    }
}

/// `host[:port]` as presented in a Host header.
pub fn url_authority(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_options() -> Options {
        let mut opts = Options::default();
        opts.cookie_secret = BASE64.encode([0u8; KEY_SIZE]);
        opts.shared_secret = "shared".to_string();
        opts.authenticate_service_url =
            Some(Url::parse("https://authenticate.example.com").unwrap());
        opts.routes
            .insert("a.example.com".to_string(), "b.internal:8080".to_string());
        opts
    }

    #[test]
    fn valid_options_pass() {
        assert!(valid_options().validate().is_ok());
    }

    #[test]
    fn empty_routes_fail() {
        let mut opts = valid_options();
        opts.routes.clear();
        let err = opts.validate().unwrap_err();
        assert!(matches!(err, ConfigError::MissingRoutes));
        assert_eq!(err.to_string(), "missing setting: routes");
    }

    #[test]
    fn unparseable_route_names_the_offender() {
        let mut opts = valid_options();
        opts.routes
            .insert("ok.example.com".to_string(), "http://[bad".to_string());
        let err = opts.validate().unwrap_err();
        assert!(err.to_string().contains("http://[bad"));
    }

    #[test]
    fn missing_authenticate_url_fails() {
        let mut opts = valid_options();
        opts.authenticate_service_url = None;
        assert!(matches!(
            opts.validate().unwrap_err(),
            ConfigError::MissingAuthenticateUrl
        ));
    }

    #[test]
    fn insecure_authenticate_url_fails() {
        let mut opts = valid_options();
        opts.authenticate_service_url =
            Some(Url::parse("http://authenticate.example.com").unwrap());
        assert!(matches!(
            opts.validate().unwrap_err(),
            ConfigError::InsecureAuthenticateUrl
        ));
    }

    #[test]
    fn cookie_secret_length_boundaries() {
        for (len, ok) in [(31usize, false), (32, true), (33, false)] {
            let mut opts = valid_options();
            opts.cookie_secret = BASE64.encode(vec![0u8; len]);
            let result = opts.validate();
            assert_eq!(result.is_ok(), ok, "len {}", len);
            if let Err(err) = result {
                assert_eq!(
                    err.to_string(),
                    format!("cookie secret expects 32 bytes but got {}", len)
                );
            }
        }
    }

    #[test]
    fn cookie_secret_bad_encoding_fails() {
        let mut opts = valid_options();
        opts.cookie_secret = "!!not-base64!!".to_string();
        assert!(matches!(
            opts.validate().unwrap_err(),
            ConfigError::CookieSecretEncoding(_)
        ));
    }

    #[test]
    fn missing_shared_secret_fails() {
        let mut opts = valid_options();
        opts.shared_secret.clear();
        assert!(matches!(
            opts.validate().unwrap_err(),
            ConfigError::MissingSharedSecret
        ));
    }

    #[test]
    fn signing_key_is_optional_but_must_be_base64() {
        let mut opts = valid_options();
        assert!(opts.signing_key.is_empty());
        assert!(opts.validate().is_ok());

        opts.signing_key = "!!not-base64!!".to_string();
        assert!(matches!(
            opts.validate().unwrap_err(),
            ConfigError::SigningKeyEncoding(_)
        ));
    }

    #[test]
    fn validation_is_idempotent_and_does_not_mutate() {
        let opts = valid_options();
        let snapshot = opts.clone();
        assert!(opts.validate().is_ok());
        assert!(opts.validate().is_ok());
        assert_eq!(opts, snapshot);
    }

    #[test]
    fn bare_hostnames_default_to_https() {
        let bare = url_parse("svc.example.com").unwrap();
        let explicit = url_parse("https://svc.example.com").unwrap();
        assert_eq!(bare, explicit);
        assert_eq!(bare.scheme(), "https");
    }

    #[test]
    fn authority_keeps_explicit_port() {
        let url = url_parse("b.internal:8080").unwrap();
        assert_eq!(url_authority(&url).unwrap(), "b.internal:8080");
        let url = url_parse("b.internal").unwrap();
        assert_eq!(url_authority(&url).unwrap(), "b.internal");
    }

    #[test]
    fn routes_env_format_parses_pairs() {
        let routes =
            parse_routes("a.example.com=b.internal:8080, c.example.com=d.internal").unwrap();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes["a.example.com"], "b.internal:8080");
        assert_eq!(routes["c.example.com"], "d.internal");
        assert!(parse_routes("no-separator").is_err());
    }
}
