//! Client-facing RPC surface.
//!
//! The service is built over two narrow capabilities instead of the full
//! replicated store: a [`Cache`] for set/get and an optional
//! [`ServerFinder`] for discovery. Tests substitute a plain byte cache for
//! the former; the supervisor wires the store into both.

use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::error::Result;
use crate::proto::cache_server::Cache as CacheRpc;
use crate::proto::{Empty, GetRequest, GetResponse, GetServersResponse, Server, SetRequest};

/// What the RPC server needs from its backing store.
#[tonic::async_trait]
pub trait Cache: Send + Sync + 'static {
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Vec<u8>>;
}

/// Server discovery capability; satisfied by the replicated store.
#[tonic::async_trait]
pub trait ServerFinder: Send + Sync + 'static {
    async fn get_servers(&self) -> Result<Vec<Server>>;
}

/// The `Cache` gRPC service implementation.
pub struct CacheService {
    cache: Arc<dyn Cache>,
    finder: Option<Arc<dyn ServerFinder>>,
}

impl CacheService {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self {
            cache,
            finder: None,
        }
    }

    pub fn with_finder(cache: Arc<dyn Cache>, finder: Arc<dyn ServerFinder>) -> Self {
        Self {
            cache,
            finder: Some(finder),
        }
    }
}

#[tonic::async_trait]
impl CacheRpc for CacheService {
    async fn set(&self, request: Request<SetRequest>) -> std::result::Result<Response<Empty>, Status> {
        let req = request.into_inner();
        self.cache.set(&req.key, req.value).await?;
        Ok(Response::new(Empty {}))
    }

    async fn get(
        &self,
        request: Request<GetRequest>,
    ) -> std::result::Result<Response<GetResponse>, Status> {
        let req = request.into_inner();
        let value = self.cache.get(&req.key).await?;
        Ok(Response::new(GetResponse { value }))
    }

    async fn get_servers(
        &self,
        _request: Request<Empty>,
    ) -> std::result::Result<Response<GetServersResponse>, Status> {
        let finder = self
            .finder
            .as_ref()
            .ok_or_else(|| Status::unimplemented("server discovery is not wired"))?;
        let servers = finder.get_servers().await?;
        Ok(Response::new(GetServersResponse { servers }))
    }
}

// A bare byte cache satisfies the RPC capability, which is what lets tests
// run the service without a raft cluster behind it.
#[tonic::async_trait]
impl Cache for crate::cache::MemoryCache {
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        crate::cache::Cache::set(self, key, value)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        crate::cache::Cache::get(self, key)
    }
}
