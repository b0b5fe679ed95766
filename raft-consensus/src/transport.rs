//! Seams between a node and the wire.
//!
//! A [`Transport`] carries requests to peers; an [`RpcHandler`] answers them.
//! The simulated network in [`crate::network`] and the TCP transport in
//! [`crate::tcp`] both sit between these two traits.

use futures::future::BoxFuture;

use crate::error::{RaftError, TransportError};
use crate::protocol::{RpcRequest, RpcResponse};
use crate::topology::PeerId;

/// Outgoing side of the RPC layer.
///
/// A call may take arbitrarily long, and any error means the outcome is
/// unknown: the peer may or may not have processed the request.
pub trait Transport: Send + Sync + 'static {
    fn call(&self, to: PeerId, request: RpcRequest)
        -> BoxFuture<'static, Result<RpcResponse, TransportError>>;
}

/// Incoming side of the RPC layer.
///
/// Handlers run to completion without waiting on the network; a returned
/// error means no reply may be sent for this request.
pub trait RpcHandler: Send + Sync + 'static {
    fn handle(&self, request: RpcRequest) -> Result<RpcResponse, RaftError>;
}
