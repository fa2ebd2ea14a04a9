// proxy module - identity-aware request forwarding

pub mod authenticator;
pub mod config;
pub mod director;
pub mod server;
pub mod upstream;

pub use authenticator::AuthenticateClient;
pub use config::{ConfigError, Options, SigningPolicy};
pub use director::Director;
pub use server::{AxumServer, Proxy, ProxyError};
pub use upstream::UpstreamProxy;
