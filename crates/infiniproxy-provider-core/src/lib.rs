//! Backend-facing abstractions for infiniproxy.
//!
//! This crate does not depend on axum or any concrete HTTP client. It defines the
//! backend registry seam, model resolution, the upstream request/response shapes
//! and the model-rejection predicate; a higher layer performs IO.

pub mod backend;
pub mod classify;
pub mod headers;
pub mod keys;
pub mod resolver;
pub mod store;
pub mod upstream;
pub mod usage;

pub use backend::{BackendService, BackendSummary, CallerIdentity, mask_secret};
pub use classify::{RejectionHeuristic, is_model_rejection};
pub use headers::{Headers, header_get, header_set};
pub use keys::{generate_api_key, hash_api_key};
pub use resolver::{ModelResolver, Resolution, ResolveError};
pub use store::{
    BackendStore, CallerDirectory, MemoryBackendStore, MemoryCallerDirectory, RegistryError,
};
pub use upstream::{
    ByteStream, HttpMethod, UpstreamBody, UpstreamFailure, UpstreamHttpRequest,
    UpstreamHttpResponse, UpstreamTransportErrorKind,
};
pub use usage::{TracingUsageSink, UsageFanout, UsageRecord, UsageSink};
