pub mod access;
pub mod client_ip;
pub mod config;
pub mod rate;
pub mod store;

pub use access::{
    AccessOutcome, AccessVerifier, AuthTransport, BackendReply, CookieJar, CookieSource,
    CookieTransport, ReqwestTransport,
};
pub use client_ip::{resolve_client_ip, HeaderValue, InboundRequest};
pub use config::{AccessConfig, GateConfig};
pub use rate::{RateLimitOptions, RateLimitOutcome, RateLimiter};
pub use store::{CounterStore, InMemoryCounterStore, StoreConfig};
