pub mod cache;
pub mod client;
pub mod error;
pub mod http;
pub mod mux;
pub mod registry;
pub mod rpc;
pub mod service;
pub mod store;

// Generated client-facing RPC types.
pub mod proto {
    tonic::include_proto!("cachet.cache");
}

pub use cache::{Cache, MemoryCache};
pub use client::Client;
pub use error::{Error, Result};
pub use service::{Config, Service};
pub use store::Store;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
