//! Proxy construction and the host-keyed dispatch table.
//!
//! `Proxy::new` runs single-threaded at startup: validate the options, derive
//! the cookie cipher, construct the shared collaborators, then build one
//! `UpstreamProxy` per route. Any per-route failure aborts the whole build so
//! a partial route set is never served. The finished table is immutable and
//! shared by reference across every in-flight request.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, Response, StatusCode};
use axum::routing::get;
use axum::Router;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::modules::crypt::{AeadCipher, Cipher, CryptError, Es256Signer, Signer};
use crate::modules::sessions::CookieStore;
use crate::proxy::authenticator::AuthenticateClient;
use crate::proxy::config::{url_authority, url_parse, ConfigError, Options};
use crate::proxy::director::{host_of, Director};
use crate::proxy::upstream::{text_response, UpstreamProxy};

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cookie-secret error: {0}")]
    Cipher(CryptError),
    #[error("route {route}: {source}")]
    Signer { route: String, source: CryptError },
}

/// Everything needed to proxy requests: the dispatch table plus the shared
/// session collaborators the authentication flow hangs off of.
pub struct Proxy {
    pass_access_token: bool,
    authenticate_client: AuthenticateClient,
    cipher: Arc<dyn Cipher>,
    session_store: Arc<CookieStore>,
    mux: HashMap<String, Arc<UpstreamProxy>>,
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy").finish_non_exhaustive()
    }
}

impl Proxy {
    /// Builds the complete dispatch table from options. All routes register
    /// or none do.
    pub fn new(opts: &Options) -> Result<Self, ProxyError> {
        opts.validate()?;

        // decodability is guaranteed by validate
        let decoded_secret = BASE64
            .decode(&opts.cookie_secret)
            .map_err(ConfigError::CookieSecretEncoding)?;
        let cipher: Arc<dyn Cipher> =
            Arc::new(AeadCipher::new(&decoded_secret).map_err(ProxyError::Cipher)?);

        let session_store = Arc::new(
            CookieStore::new(opts.cookie_name.as_str(), Arc::clone(&cipher))
                .with_domain(opts.cookie_domain.as_str())
                .with_expire(opts.cookie_expire)
                .with_http_only(opts.cookie_http_only),
        );

        let auth_url = opts
            .authenticate_service_url
            .clone()
            .ok_or(ConfigError::MissingAuthenticateUrl)?;
        let authenticate_client = AuthenticateClient::new(
            auth_url,
            opts.shared_secret.as_str(),
            opts.session_lifetime_ttl,
            opts.session_valid_ttl,
            opts.grace_period_ttl,
        );

        let signing_key = if opts.signing_key.is_empty() {
            None
        } else {
            Some(
                BASE64
                    .decode(&opts.signing_key)
                    .map_err(ConfigError::SigningKeyEncoding)?,
            )
        };

        let mut mux = HashMap::with_capacity(opts.routes.len());
        for (from, to) in &opts.routes {
            let from_url = url_parse(from).map_err(|source| ConfigError::BadRouteUrl {
                route: from.clone(),
                source,
            })?;
            let to_url = url_parse(to).map_err(|source| ConfigError::BadRouteUrl {
                route: to.clone(),
                source,
            })?;
            let from_host =
                url_authority(&from_url).ok_or_else(|| ConfigError::BadRouteUrl {
                    route: from.clone(),
                    source: url::ParseError::EmptyHost,
                })?;

            let director = Director::new(to_url);
            let to_host = director.upstream_authority().to_string();

            // issuer identity is bound to the route's public host
            let signer: Option<Arc<dyn Signer>> = match &signing_key {
                Some(der) => Some(Arc::new(
                    Es256Signer::new(der, from_host.as_str()).map_err(|source| {
                        ProxyError::Signer {
                            route: from.clone(),
                            source,
                        }
                    })?,
                )),
                None => None,
            };

            let handler = UpstreamProxy::new(
                director,
                opts.cookie_name.as_str(),
                signer,
                opts.signing_policy,
                opts.default_upstream_timeout,
            );
            info!(from = %from_host, to = %to_host, "registered route");
            mux.insert(from_host, Arc::new(handler));
        }

        Ok(Self {
            pass_access_token: opts.pass_access_token,
            authenticate_client,
            cipher,
            session_store,
            mux,
        })
    }

    /// Exact-match lookup by inbound Host header.
    pub fn handler(&self, host: &str) -> Option<&Arc<UpstreamProxy>> {
        self.mux.get(host)
    }

    pub fn route_count(&self) -> usize {
        self.mux.len()
    }

    pub fn pass_access_token(&self) -> bool {
        self.pass_access_token
    }

    pub fn authenticate_client(&self) -> &AuthenticateClient {
        &self.authenticate_client
    }

    pub fn cipher(&self) -> &Arc<dyn Cipher> {
        &self.cipher
    }

    /// The cookie store doubles as session store and CSRF store.
    pub fn session_store(&self) -> &Arc<CookieStore> {
        &self.session_store
    }
}

#[derive(Clone)]
pub struct AppState {
    pub proxy: Arc<Proxy>,
}

/// Selects the route for the request's Host header and runs its pipeline.
/// Hosts without a registration are answered 404 here.
async fn dispatch(State(state): State<AppState>, req: Request<Body>) -> Response<Body> {
    let Some(host) = host_of(req.headers(), req.uri()) else {
        return text_response(StatusCode::BAD_REQUEST, "missing host".to_string());
    };
    match state.proxy.handler(&host) {
        Some(route) => route.serve(req).await,
        None => text_response(StatusCode::NOT_FOUND, format!("no route for {}", host)),
    }
}

async fn healthz() -> &'static str {
    "ok"
}

/// Axum server instance
pub struct AxumServer {
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl AxumServer {
    /// Binds and starts serving the dispatch table. Returns the server handle
    /// and the join handle of the serving task.
    pub async fn start(
        host: String,
        port: u16,
        proxy: Arc<Proxy>,
    ) -> Result<(Self, JoinHandle<()>), std::io::Error> {
        let state = AppState { proxy };
        let app = Router::new()
            .route("/healthz", get(healthz))
            .fallback(dispatch)
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        let listener = tokio::net::TcpListener::bind((host.as_str(), port)).await?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(err) = serve.await {
                error!("proxy server error: {}", err);
            }
        });

        Ok((
            Self {
                shutdown_tx: Some(shutdown_tx),
            },
            handle,
        ))
    }

    pub fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::crypt::{generate_pkcs8_key, KEY_SIZE};
    use crate::proxy::upstream::{HEADER_EMAIL, HEADER_JWT, HEADER_USER_ID};
    use axum::http::{header, HeaderValue};
    use axum::Json;
    use std::net::SocketAddr;
    use std::time::Duration;
    use url::Url;

    fn test_options(routes: HashMap<String, String>) -> Options {
        let mut opts = Options::default();
        opts.cookie_secret = BASE64.encode([0u8; KEY_SIZE]);
        opts.shared_secret = "shared".to_string();
        opts.authenticate_service_url =
            Some(Url::parse("https://authenticate.example.com").unwrap());
        opts.routes = routes;
        opts
    }

    fn routes_to(from: &str, to: String) -> HashMap<String, String> {
        let mut routes = HashMap::new();
        routes.insert(from.to_string(), to);
        routes
    }

    async fn echo(req: Request<Body>) -> Json<serde_json::Value> {
        let headers: HashMap<String, String> = req
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        Json(serde_json::json!({ "headers": headers }))
    }

    async fn spawn_echo_upstream() -> SocketAddr {
        let app = Router::new().fallback(echo);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    /// Accepts connections, reads, and never answers.
    async fn spawn_stuck_upstream() -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    use tokio::io::AsyncReadExt;
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = socket.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    async fn body_json(response: Response<Body>) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn forwards_with_forwarded_host_and_scrubbed_cookies() {
        let addr = spawn_echo_upstream().await;
        let opts = test_options(routes_to("a.example.com", format!("http://{}", addr)));
        let proxy = Proxy::new(&opts).unwrap();

        let req = Request::builder()
            .uri("/anything?x=1")
            .header(header::HOST, "a.example.com")
            .header(header::COOKIE, "_hostgate_proxy=abc; other=xyz")
            .body(Body::empty())
            .unwrap();
        let handler = proxy.handler("a.example.com").expect("route registered");
        let response = handler.serve(req).await;
        assert_eq!(response.status(), StatusCode::OK);

        let seen = body_json(response).await;
        let headers = &seen["headers"];
        assert_eq!(headers["x-forwarded-host"], "a.example.com");
        assert_eq!(headers["cookie"], "other=xyz");
        assert_eq!(headers["host"], addr.to_string());
    }

    #[tokio::test]
    async fn unknown_host_is_not_dispatched() {
        let addr = spawn_echo_upstream().await;
        let opts = test_options(routes_to("a.example.com", format!("http://{}", addr)));
        let proxy = Proxy::new(&opts).unwrap();
        assert!(proxy.handler("b.example.com").is_none());
        assert_eq!(proxy.route_count(), 1);
    }

    #[tokio::test]
    async fn timeout_is_per_route_and_isolated() {
        let stuck_addr = spawn_stuck_upstream().await;
        let fast_addr = spawn_echo_upstream().await;
        let mut routes = HashMap::new();
        routes.insert("slow.example.com".to_string(), format!("http://{}", stuck_addr));
        routes.insert("fast.example.com".to_string(), format!("http://{}", fast_addr));
        let mut opts = test_options(routes);
        opts.default_upstream_timeout = Duration::from_millis(200);
        let proxy = Proxy::new(&opts).unwrap();

        let slow = Arc::clone(proxy.handler("slow.example.com").unwrap());
        let fast = Arc::clone(proxy.handler("fast.example.com").unwrap());
        let slow_req = Request::builder()
            .uri("/")
            .header(header::HOST, "slow.example.com")
            .body(Body::empty())
            .unwrap();
        let fast_req = Request::builder()
            .uri("/")
            .header(header::HOST, "fast.example.com")
            .body(Body::empty())
            .unwrap();

        let started = std::time::Instant::now();
        let (slow_response, fast_response) =
            tokio::join!(slow.serve(slow_req), fast.serve(fast_req));

        assert_eq!(slow_response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(fast_response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(slow_response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains(&stuck_addr.to_string()));
        assert!(text.contains("200ms"));
    }

    #[tokio::test]
    async fn attaches_assertion_only_when_claims_present() {
        let addr = spawn_echo_upstream().await;
        let mut opts = test_options(routes_to("a.example.com", format!("http://{}", addr)));
        opts.signing_key = BASE64.encode(generate_pkcs8_key());
        let proxy = Proxy::new(&opts).unwrap();
        let handler = proxy.handler("a.example.com").unwrap();

        let req = Request::builder()
            .uri("/")
            .header(header::HOST, "a.example.com")
            .header(HEADER_USER_ID, HeaderValue::from_static("user-1"))
            .header(HEADER_EMAIL, HeaderValue::from_static("user@example.com"))
            .body(Body::empty())
            .unwrap();
        let seen = body_json(handler.serve(req).await).await;
        let token = seen["headers"][HEADER_JWT].as_str().unwrap();
        assert_eq!(token.split('.').count(), 3);

        let req = Request::builder()
            .uri("/")
            .header(header::HOST, "a.example.com")
            .body(Body::empty())
            .unwrap();
        let seen = body_json(handler.serve(req).await).await;
        assert!(seen["headers"].get(HEADER_JWT).is_none());
    }

    #[tokio::test]
    async fn malformed_signing_key_aborts_the_whole_build() {
        let mut opts = test_options(routes_to("a.example.com", "b.internal:8080".to_string()));
        // valid base64, but not a key
        opts.signing_key = BASE64.encode(b"not a key");
        assert!(matches!(
            Proxy::new(&opts).unwrap_err(),
            ProxyError::Signer { .. }
        ));
    }

    #[tokio::test]
    async fn empty_routes_never_construct() {
        let opts = test_options(HashMap::new());
        assert!(matches!(
            Proxy::new(&opts).unwrap_err(),
            ProxyError::Config(ConfigError::MissingRoutes)
        ));
    }

    #[tokio::test]
    async fn dispatch_answers_404_for_unregistered_host() {
        let addr = spawn_echo_upstream().await;
        let opts = test_options(routes_to("a.example.com", format!("http://{}", addr)));
        let proxy = Arc::new(Proxy::new(&opts).unwrap());
        let state = AppState { proxy };

        let req = Request::builder()
            .uri("/")
            .header(header::HOST, "nobody.example.com")
            .body(Body::empty())
            .unwrap();
        let response = dispatch(State(state), req).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
