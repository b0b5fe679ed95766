//! RPC over TCP.
//!
//! Each request and reply is one JSON object on its own line. A client opens
//! a connection per call; the server answers any number of requests on a
//! connection and closes it without a reply when the handler refuses one.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::protocol::{RpcRequest, RpcResponse};
use crate::topology::PeerId;
use crate::transport::{RpcHandler, Transport};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Upper bound on one framed message. A full AppendEntries batch stays far
/// below it.
const MAX_MESSAGE_BYTES: u64 = 16 * 1024 * 1024;

/// Sends requests to peers at fixed addresses.
pub struct TcpTransport {
    peers: HashMap<PeerId, String>,
    call_timeout: Duration,
}

impl TcpTransport {
    pub fn new(peers: HashMap<PeerId, String>, call_timeout: Duration) -> Self {
        Self {
            peers,
            call_timeout,
        }
    }
}

impl Transport for TcpTransport {
    fn call(
        &self,
        to: PeerId,
        request: RpcRequest,
    ) -> BoxFuture<'static, Result<RpcResponse, TransportError>> {
        let addr = self.peers.get(&to).cloned();
        let call_timeout = self.call_timeout;
        async move {
            let addr = addr.ok_or(TransportError::Unreachable(to))?;
            tokio::time::timeout(call_timeout, exchange(&addr, &request))
                .await
                .map_err(|_| TransportError::Timeout)?
        }
        .boxed()
    }
}

async fn exchange(addr: &str, request: &RpcRequest) -> Result<RpcResponse, TransportError> {
    let stream = TcpStream::connect(addr).await?;
    let (reader, mut writer) = stream.into_split();
    write_message(&mut writer, request).await?;
    let mut reader = BufReader::new(reader);
    read_message(&mut reader)
        .await?
        .ok_or(TransportError::Dropped)
}

/// Accepts peer connections and answers their requests with `handler`
/// until `shutdown` resolves.
pub async fn serve<F>(
    listener: TcpListener,
    handler: Arc<dyn RpcHandler>,
    shutdown: F,
) -> io::Result<()>
where
    F: Future<Output = ()> + Send,
{
    let local = listener.local_addr()?;
    info!(addr = %local, "rpc server listening");
    tokio::pin!(shutdown);

    loop {
        select! {
            _ = &mut shutdown => {
                info!(addr = %local, "rpc server shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => spawn_connection(stream, peer, &handler),
                Err(err) => warn!(error = ?err, "failed to accept connection"),
            }
        }
    }
    Ok(())
}

fn spawn_connection(stream: TcpStream, peer: SocketAddr, handler: &Arc<dyn RpcHandler>) {
    let handler = Arc::clone(handler);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, handler).await {
            debug!(peer = %peer, error = ?err, "rpc connection closed with error");
        }
    });
}

async fn handle_connection(stream: TcpStream, handler: Arc<dyn RpcHandler>) -> io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    while let Some(request) = read_message::<_, RpcRequest>(&mut reader).await? {
        let name = request.name();
        match handler.handle(request) {
            Ok(response) => write_message(&mut writer, &response).await?,
            Err(err) => {
                debug!(rpc = name, error = %err, "handler refused request, closing connection");
                break;
            }
        }
    }
    Ok(())
}

/// Reads the next JSON line, skipping blank ones. `Ok(None)` means the peer
/// closed the connection.
pub(crate) async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    read_bounded(reader, MAX_MESSAGE_BYTES).await
}

async fn read_bounded<R, T>(reader: &mut R, limit: u64) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        let read = (&mut *reader).take(limit).read_line(&mut line).await?;
        if read == 0 {
            return Ok(None);
        }
        if read as u64 == limit && !line.ends_with('\n') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("message exceeds {limit} bytes"),
            ));
        }

        let body = line.trim_end_matches(LINE_ENDINGS);
        if !body.is_empty() {
            return serde_json::from_str(body).map(Some).map_err(to_io_error);
        }
    }
}

pub(crate) async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut frame = Vec::with_capacity(256);
    serde_json::to_writer(&mut frame, message).map_err(to_io_error)?;
    frame.push(b'\n');
    writer.write_all(&frame).await?;
    writer.flush().await
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
