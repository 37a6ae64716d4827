pub mod auth;
pub mod bootstrap;
pub mod core;
pub mod error;
pub mod handler;
pub mod invoker;
pub mod upstream_client;

pub use auth::{Authenticator, extract_api_key};
pub use core::{Core, CoreState};
pub use error::{ErrorFormat, GatewayError, ProxyError};
pub use invoker::{Completion, CompletionInvoker, CompletionStream, StreamItem};
pub use upstream_client::{UpstreamClient, UpstreamClientConfig, WreqUpstreamClient};
