//! In-process simulated network for exercising clusters without sockets.
//!
//! Every node registers an [`RpcHandler`] under its id and sends through a
//! [`Transport`] obtained from [`Network::transport`]. The network can cut a
//! node off, drop and delay messages, and counts every call it carries.
//!
//! Failure behavior:
//!
//! - a call from or to a disconnected or missing node fails after a short
//!   random delay, without reaching the handler
//! - in unreliable mode each request is delayed up to 27 ms, and 10% of
//!   requests and 10% of replies are lost
//! - a reply is lost if either side was disconnected, or the destination was
//!   replaced by a restarted instance, while the handler ran

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

use crate::error::TransportError;
use crate::protocol::{RpcRequest, RpcResponse};
use crate::topology::PeerId;
use crate::transport::{RpcHandler, Transport};

const UNREACHABLE_DELAY_MS: u64 = 100;
const UNRELIABLE_DELAY_MS: u64 = 27;
const UNRELIABLE_LOSS: f64 = 0.1;

#[derive(Clone)]
pub struct Network {
    inner: Arc<NetworkInner>,
}

struct NetworkInner {
    endpoints: Mutex<HashMap<PeerId, Endpoint>>,
    reliable: AtomicBool,
    rpc_count: AtomicU64,
    rng: Mutex<StdRng>,
}

struct Endpoint {
    handler: Option<Arc<dyn RpcHandler>>,
    connected: bool,
    // Bumped on every register so replies from a replaced instance are lost.
    generation: u64,
}

impl Default for Network {
    fn default() -> Self {
        Self::new()
    }
}

impl Network {
    pub fn new() -> Self {
        Self::build(StdRng::from_entropy())
    }

    pub fn with_seed(seed: u64) -> Self {
        Self::build(StdRng::seed_from_u64(seed))
    }

    fn build(rng: StdRng) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                endpoints: Mutex::new(HashMap::new()),
                reliable: AtomicBool::new(true),
                rpc_count: AtomicU64::new(0),
                rng: Mutex::new(rng),
            }),
        }
    }

    /// Installs `handler` as node `id`, replacing any previous instance.
    /// A new node starts connected; a replaced one keeps its connectivity.
    pub fn register(&self, id: PeerId, handler: Arc<dyn RpcHandler>) {
        let mut endpoints = self.inner.endpoints.lock().unwrap();
        let endpoint = endpoints.entry(id).or_insert(Endpoint {
            handler: None,
            connected: true,
            generation: 0,
        });
        endpoint.handler = Some(handler);
        endpoint.generation += 1;
    }

    /// Detaches node `id`'s handler, as if the process crashed.
    pub fn remove(&self, id: PeerId) {
        if let Some(endpoint) = self.inner.endpoints.lock().unwrap().get_mut(&id) {
            endpoint.handler = None;
            endpoint.generation += 1;
        }
    }

    pub fn connect(&self, id: PeerId) {
        self.set_connected(id, true);
    }

    pub fn disconnect(&self, id: PeerId) {
        self.set_connected(id, false);
    }

    fn set_connected(&self, id: PeerId, connected: bool) {
        let mut endpoints = self.inner.endpoints.lock().unwrap();
        let endpoint = endpoints.entry(id).or_insert(Endpoint {
            handler: None,
            connected,
            generation: 0,
        });
        endpoint.connected = connected;
    }

    pub fn is_connected(&self, id: PeerId) -> bool {
        self.inner
            .endpoints
            .lock()
            .unwrap()
            .get(&id)
            .is_some_and(|endpoint| endpoint.connected)
    }

    pub fn set_reliable(&self, reliable: bool) {
        self.inner.reliable.store(reliable, Ordering::SeqCst);
    }

    /// Total number of calls attempted through this network.
    pub fn rpc_count(&self) -> u64 {
        self.inner.rpc_count.load(Ordering::SeqCst)
    }

    /// A transport that sends on behalf of node `from`.
    pub fn transport(&self, from: PeerId) -> Arc<dyn Transport> {
        Arc::new(NetworkTransport {
            from,
            network: self.clone(),
        })
    }

    async fn deliver(
        &self,
        from: PeerId,
        to: PeerId,
        request: RpcRequest,
    ) -> Result<RpcResponse, TransportError> {
        self.inner.rpc_count.fetch_add(1, Ordering::SeqCst);
        let reliable = self.inner.reliable.load(Ordering::SeqCst);

        let Some((handler, generation)) = self.route(from, to) else {
            tokio::time::sleep(self.jitter(UNREACHABLE_DELAY_MS)).await;
            return Err(TransportError::Unreachable(to));
        };

        if !reliable {
            tokio::time::sleep(self.jitter(UNRELIABLE_DELAY_MS)).await;
            if self.lose() {
                trace!(from, to, rpc = request.name(), "request dropped");
                return Err(TransportError::Dropped);
            }
        }

        let response = handler
            .handle(request)
            .map_err(|err| TransportError::Remote(err.to_string()))?;

        match self.route(from, to) {
            Some((_, current)) if current == generation => {}
            _ => return Err(TransportError::Dropped),
        }
        if !reliable && self.lose() {
            trace!(from, to, "reply dropped");
            return Err(TransportError::Dropped);
        }
        Ok(response)
    }

    /// Handler and generation of `to`, if both ends are connected and `to`
    /// is running.
    fn route(&self, from: PeerId, to: PeerId) -> Option<(Arc<dyn RpcHandler>, u64)> {
        let endpoints = self.inner.endpoints.lock().unwrap();
        if !endpoints.get(&from).is_some_and(|endpoint| endpoint.connected) {
            return None;
        }
        let target = endpoints.get(&to).filter(|endpoint| endpoint.connected)?;
        let handler = target.handler.clone()?;
        Some((handler, target.generation))
    }

    fn jitter(&self, max_ms: u64) -> Duration {
        Duration::from_millis(self.inner.rng.lock().unwrap().gen_range(0..=max_ms))
    }

    fn lose(&self) -> bool {
        self.inner.rng.lock().unwrap().gen_bool(UNRELIABLE_LOSS)
    }
}

struct NetworkTransport {
    from: PeerId,
    network: Network,
}

impl Transport for NetworkTransport {
    fn call(
        &self,
        to: PeerId,
        request: RpcRequest,
    ) -> BoxFuture<'static, Result<RpcResponse, TransportError>> {
        let network = self.network.clone();
        let from = self.from;
        async move { network.deliver(from, to, request).await }.boxed()
    }
}
