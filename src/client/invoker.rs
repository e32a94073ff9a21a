//! The single-connection client: serialized sends, one receive loop, and a
//! pending map tying responses back to their calls.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::{AbortHandle, Abortable};
use log::*;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;

use courier_rpc_core::error::{ErrorKind, RpcError};
use courier_rpc_core::frame::{FrameHead, RequestHeader, ResponseHeader, FRAME_HEAD_LEN, FRAME_RESPONSE};
use courier_rpc_core::{Codec, TimeoutSetting};

use crate::net::{split_stream, ConnReader, ConnWriter, NetStream};
use crate::plugin::ClientPluginContainer;

use super::selector::Endpoint;
use super::{done_channel, Call, CallTx};
use super::conn::write_request;

/// One client-side connection.
///
/// Sends run on the caller's task under the send lock; a single spawned
/// task drives the receive loop. Ownership of a pending call's removal:
/// the receiver owns it on response, the sender owns it on write failure,
/// teardown drains whatever remains and signals each call exactly once.
pub struct Invoker<C: Codec> {
    endpoint: Endpoint,
    codec: Arc<C>,
    seq: AtomicU64,
    pending: Mutex<HashMap<u64, Call>>,
    writer: AsyncMutex<ConnWriter>,
    plugins: Arc<ClientPluginContainer>,
    timeouts: TimeoutSetting,
    closing: AtomicBool,
    shutdown: AtomicBool,
    read_abort: AbortHandle,
}

impl<C: Codec> Invoker<C> {
    /// Bind a dialed (and possibly plugin-wrapped) stream and start the
    /// receive loop.
    pub(crate) fn start(
        stream: NetStream, endpoint: Endpoint, plugins: Arc<ClientPluginContainer>,
        timeouts: TimeoutSetting,
    ) -> Arc<Self> {
        let (reader, writer) = split_stream(stream);
        let (read_abort, abort_reg) = AbortHandle::new_pair();
        let invoker = Arc::new(Self {
            endpoint,
            codec: Arc::new(C::default()),
            seq: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            writer: AsyncMutex::new(writer),
            plugins,
            timeouts,
            closing: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            read_abort,
        });
        let inv = invoker.clone();
        tokio::spawn(async move {
            let mut reader = reader;
            match Abortable::new(inv.receive_loop(&mut reader), abort_reg).await {
                Ok(Err(e)) => debug!("{:?} receive loop: {}", inv, e),
                Ok(Ok(())) => {}
                Err(_aborted) => trace!("{:?} receive loop aborted", inv),
            }
            inv.teardown();
        });
        invoker
    }

    #[inline]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// True once the connection can no longer carry calls.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire) || self.shutdown.load(Ordering::Acquire)
    }

    /// Synchronous call: one request, one decoded reply.
    pub async fn call<A, R>(&self, service_method: &str, args: &A, reply: &mut R) -> Result<(), RpcError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let body = self
            .codec
            .encode(args)
            .map_err(|()| RpcError::new(ErrorKind::WriteRequest, "WriteRequest: args encode failed"))?;
        let (tx, rx) = done_channel(1);
        self.go_raw(service_method, body, tx).await;
        let call = match rx.recv().await {
            Ok(call) => call,
            Err(_) => return Err(RpcError::shutdown()),
        };
        call.into_result(self.codec.as_ref(), reply)
    }

    /// Asynchronous call with a pre-encoded body. The call signals `done`
    /// exactly once: on response, write failure, or teardown.
    pub(crate) async fn go_raw(&self, service_method: &str, body: Vec<u8>, done: CallTx) {
        let mut call = Call::new(service_method, done);
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        {
            let mut pending = self.pending.lock().unwrap();
            // checked under the map lock so a concurrent teardown either
            // sees this call or this check sees the teardown
            if self.is_closed() {
                drop(pending);
                call.error = Some(RpcError::shutdown());
                call.done();
                return;
            }
            pending.insert(seq, call);
        }

        let header = RequestHeader { seq, service_method: service_method.to_string() };
        let r = {
            let mut w = self.writer.lock().await;
            write_request(&mut w, self.codec.as_ref(), &self.plugins, &self.timeouts, &header, &body)
                .await
        };
        if let Err(e) = r {
            warn!("{:?} send seq={} failed: {}", self, seq, e);
            // the receiver may have claimed it during teardown
            if let Some(mut call) = self.pending.lock().unwrap().remove(&seq) {
                call.error = Some(e);
                call.done();
            }
        }
    }

    async fn receive_loop(&self, reader: &mut ConnReader) -> Result<(), RpcError> {
        loop {
            self.recv_one(reader).await?;
        }
    }

    async fn recv_one(&self, reader: &mut ConnReader) -> Result<(), RpcError> {
        let rt = self.timeouts.effective_read();
        self.plugins
            .do_pre_read_response_header()
            .map_err(|e| RpcError::new(ErrorKind::ReadResponseHeader, e.message()))?;

        let mut head_buf = [0u8; FRAME_HEAD_LEN];
        reader.read_exact_timeout(&mut head_buf, rt).await.map_err(|e| {
            RpcError::new(ErrorKind::ReadResponseHeader, format!("ReadResponseHeader: {}", e))
        })?;
        let frame = FrameHead::decode(&head_buf, FRAME_RESPONSE).map_err(|e| {
            RpcError::new(ErrorKind::ReadResponseHeader, format!("ReadResponseHeader: {}", e))
        })?;
        let header_len = frame.header_len.get() as usize;
        let body_len = frame.body_len.get() as usize;

        let header: ResponseHeader = {
            let buf = reader.read_payload(header_len, rt).await.map_err(|e| {
                RpcError::new(ErrorKind::ReadResponseHeader, format!("ReadResponseHeader: {}", e))
            })?;
            self.codec.decode(buf).map_err(|()| {
                RpcError::new(ErrorKind::ReadResponseHeader, "ReadResponseHeader: header decode failed")
            })?
        };
        self.plugins
            .do_post_read_response_header(&header)
            .map_err(|e| RpcError::new(ErrorKind::ReadResponseHeader, e.message()))?;

        let call = self.pending.lock().unwrap().remove(&header.seq);
        let mut call = match call {
            Some(call) => call,
            None => {
                // orphaned response, read the body as a placeholder
                trace!("{:?} no pending call for seq {}", self, header.seq);
                if body_len > 0 {
                    reader.discard(body_len, rt).await.map_err(|e| {
                        RpcError::new(ErrorKind::ReadResponseBody, format!("ReadResponseBody: {}", e))
                    })?;
                }
                return Ok(());
            }
        };

        if !header.error.is_empty() {
            if body_len > 0 {
                if let Err(e) = reader.discard(body_len, rt).await {
                    let e = RpcError::new(
                        ErrorKind::ReadResponseBody,
                        format!("ReadResponseBody: {}", e),
                    );
                    call.error = Some(e.clone());
                    call.done();
                    return Err(e);
                }
            }
            call.error = Some(RpcError::from_wire(&header.error));
            call.done();
            return Ok(());
        }

        if let Err(e) = self.plugins.do_pre_read_response_body(&header) {
            let e = RpcError::new(ErrorKind::ReadResponseBody, e.message());
            call.error = Some(e.clone());
            call.done();
            return Err(e);
        }
        match reader.read_payload(body_len, rt).await {
            Err(e) => {
                let e =
                    RpcError::new(ErrorKind::ReadResponseBody, format!("ReadResponseBody: {}", e));
                call.error = Some(e.clone());
                call.done();
                Err(e)
            }
            Ok(body) => {
                if let Err(e) = self.plugins.do_post_read_response_body(&header, body) {
                    let e = RpcError::new(ErrorKind::ReadResponseBody, e.message());
                    call.error = Some(e.clone());
                    call.done();
                    return Err(e);
                }
                trace!("{:?} recv seq={} ok", self, header.seq);
                call.reply = Some(body.to_vec());
                call.done();
                Ok(())
            }
        }
    }

    /// Signal every remaining pending call with the shutdown error. Runs in
    /// the receiver task after the loop exits, and is idempotent by way of
    /// the drained map.
    fn teardown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let mut pending = self.pending.lock().unwrap();
        for (_seq, mut call) in pending.drain() {
            call.error = Some(RpcError::shutdown());
            call.done();
        }
    }

    /// Reject new calls and stop the receive loop; pending calls get the
    /// shutdown error. Does not touch the socket, which closes when the
    /// last reference drops.
    pub(crate) fn shutdown_now(&self) {
        self.closing.store(true, Ordering::Release);
        self.read_abort.abort();
    }

    /// Close the connection: shut the write side down so the server sees
    /// EOF, then tear down the receive loop.
    pub async fn close(&self) {
        self.closing.store(true, Ordering::Release);
        {
            let mut w = self.writer.lock().await;
            w.shutdown().await;
        }
        self.read_abort.abort();
    }
}

impl<C: Codec> fmt::Debug for Invoker<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invoker {}", self.endpoint)
    }
}
