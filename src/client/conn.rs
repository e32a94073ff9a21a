//! Dialing and the plugin/timeout-wrapped write side of the client codec.

use std::marker::PhantomData;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use log::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use zerocopy::AsBytes;

use courier_rpc_core::error::{ErrorKind, RpcError};
use courier_rpc_core::frame::{FrameHead, RequestHeader, FRAME_REQUEST};
use courier_rpc_core::{ClientConfig, Codec, TimeoutSetting};

use crate::net::{ConnWriter, NetAddr, NetStream};
use crate::plugin::ClientPluginContainer;
use crate::server::CONNECTED;

use super::invoker::Invoker;
use super::selector::Endpoint;

/// Dials endpoints and starts invokers on the resulting connections.
/// Injected into the selector as its invoker factory.
pub(crate) struct Connector<C: Codec> {
    timeouts: TimeoutSetting,
    plugins: Arc<ClientPluginContainer>,
    http_path: String,
    _codec: PhantomData<fn() -> C>,
}

impl<C: Codec> Connector<C> {
    pub(crate) fn new(config: &ClientConfig, plugins: Arc<ClientPluginContainer>) -> Arc<Self> {
        Arc::new(Self {
            timeouts: config.timeouts,
            plugins,
            http_path: config.http_path.clone(),
            _codec: PhantomData,
        })
    }

    /// Dial one endpoint and spin up its invoker. `dial_timeout` of zero
    /// falls back to the configured connect timeout.
    pub(crate) async fn connect(
        &self, endpoint: &Endpoint, dial_timeout: Duration,
    ) -> Result<Arc<Invoker<C>>, RpcError> {
        let dial_timeout = if dial_timeout.is_zero() {
            self.timeouts.connect_timeout
        } else {
            dial_timeout
        };
        let addr = NetAddr::from_str(&endpoint.address)
            .map_err(|e| dial_error(endpoint, &format!("{:?}", e)))?;
        let stream = NetStream::connect_timeout(&addr, dial_timeout)
            .await
            .map_err(|e| dial_error(endpoint, &e.to_string()))?;
        let stream = self
            .plugins
            .do_post_connected(stream)
            .map_err(|e| dial_error(endpoint, e.message()))?;
        let stream = match endpoint.network.as_str() {
            "http" => self.http_handshake(stream, endpoint).await?,
            _ => stream,
        };
        debug!("connected to {}", endpoint);
        Ok(Invoker::start(stream, endpoint.clone(), self.plugins.clone(), self.timeouts))
    }

    /// `CONNECT <path> HTTP/1.0` upgrade; only a Connected status hands the
    /// stream over to the RPC protocol.
    async fn http_handshake(
        &self, mut stream: NetStream, endpoint: &Endpoint,
    ) -> Result<NetStream, RpcError> {
        let req = format!("CONNECT {} HTTP/1.0\n\n", self.http_path);
        stream
            .write_all(req.as_bytes())
            .await
            .map_err(|e| dial_error(endpoint, &e.to_string()))?;
        stream.flush().await.map_err(|e| dial_error(endpoint, &e.to_string()))?;

        let mut head: Vec<u8> = Vec::with_capacity(64);
        let mut byte = [0u8; 1];
        loop {
            stream
                .read_exact(&mut byte)
                .await
                .map_err(|e| dial_error(endpoint, &e.to_string()))?;
            head.push(byte[0]);
            if head.len() > 4096 {
                return Err(dial_error(endpoint, "http response too large"));
            }
            if head.ends_with(b"\n\n") || head.ends_with(b"\r\n\r\n") {
                break;
            }
        }
        let head = String::from_utf8_lossy(&head);
        let status = head.lines().next().unwrap_or("");
        if !status.contains(CONNECTED) {
            return Err(dial_error(endpoint, &format!("unexpected HTTP response: {}", status)));
        }
        Ok(stream)
    }
}

#[inline]
fn dial_error(endpoint: &Endpoint, msg: &str) -> RpcError {
    RpcError::new(ErrorKind::Dial, format!("dial error: {} {}: {}", endpoint.network, endpoint.address, msg))
}

/// Write one request atomically: plugin pre hooks, frame + header + body,
/// flush, plugin post hooks. Caller holds the invoker's send lock.
pub(crate) async fn write_request<C: Codec>(
    w: &mut ConnWriter, codec: &C, plugins: &ClientPluginContainer, timeouts: &TimeoutSetting,
    header: &RequestHeader, body: &[u8],
) -> Result<(), RpcError> {
    plugins
        .do_pre_write_request(header, body)
        .map_err(|e| RpcError::new(ErrorKind::WriteRequest, e.message()))?;

    let mut head_buf = Vec::with_capacity(64);
    if codec.encode_into(header, &mut head_buf).is_err() {
        return Err(RpcError::new(ErrorKind::WriteRequest, "WriteRequest: header encode failed"));
    }
    let frame = FrameHead::new(FRAME_REQUEST, head_buf.len(), body.len());
    let wt = timeouts.effective_write();
    let io_err =
        |e: std::io::Error| RpcError::new(ErrorKind::WriteRequest, format!("WriteRequest: {}", e));
    w.write_timeout(frame.as_bytes(), wt).await.map_err(io_err)?;
    w.write_timeout(&head_buf, wt).await.map_err(io_err)?;
    if !body.is_empty() {
        w.write_timeout(body, wt).await.map_err(io_err)?;
    }
    w.flush_timeout(wt).await.map_err(io_err)?;

    plugins
        .do_post_write_request(header, body)
        .map_err(|e| RpcError::new(ErrorKind::WriteRequest, e.message()))?;
    Ok(())
}
