//! The server side of one connection: a raw stream with the codec bound
//! lazily, after the accept hooks had their chance to replace it.

use std::io;
use std::sync::Arc;

use log::*;
use tokio::sync::Mutex as AsyncMutex;

use courier_rpc_core::frame::{
    FrameError, FrameHead, ResponseHeader, FRAME_HEAD_LEN, FRAME_REQUEST, FRAME_RESPONSE,
};
use courier_rpc_core::{Codec, TimeoutSetting};

use crate::net::{split_stream, ConnReader, ConnWriter, NetStream};

pub(crate) enum HeadError {
    /// Clean end-of-stream while waiting for the next request.
    Eof,
    Io(io::Error),
    Frame(FrameError),
}

/// Reader side plus a cloneable response writer for one connection.
pub(crate) struct ServerCodecConn<C: Codec> {
    pub(crate) codec: Arc<C>,
    pub(crate) reader: ConnReader,
    pub(crate) resp: RespWriter<C>,
    timeouts: TimeoutSetting,
}

impl<C: Codec> ServerCodecConn<C> {
    /// Bind the codec to a (possibly plugin-wrapped) stream.
    pub(crate) fn bind(stream: NetStream, timeouts: TimeoutSetting) -> Self {
        let codec = Arc::new(C::default());
        let (reader, writer) = split_stream(stream);
        Self {
            codec: codec.clone(),
            reader,
            resp: RespWriter { codec, writer: Arc::new(AsyncMutex::new(writer)), timeouts },
            timeouts,
        }
    }

    /// Wait for the next request preamble. Bounded by the idle timeout.
    pub(crate) async fn read_request_frame(&mut self) -> Result<FrameHead, HeadError> {
        let mut buf = [0u8; FRAME_HEAD_LEN];
        if let Err(e) = self.reader.read_exact_timeout(&mut buf, self.timeouts.effective_idle()).await
        {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                return Err(HeadError::Eof);
            }
            return Err(HeadError::Io(e));
        }
        FrameHead::decode(&buf, FRAME_REQUEST).map_err(HeadError::Frame)
    }
}

/// Serializes response writes of one connection: one writer locks, writes
/// header and body contiguously, flushes, unlocks. Cloned into every
/// handler task.
pub(crate) struct RespWriter<C: Codec> {
    codec: Arc<C>,
    writer: Arc<AsyncMutex<ConnWriter>>,
    timeouts: TimeoutSetting,
}

impl<C: Codec> Clone for RespWriter<C> {
    fn clone(&self) -> Self {
        Self { codec: self.codec.clone(), writer: self.writer.clone(), timeouts: self.timeouts }
    }
}

impl<C: Codec> RespWriter<C> {
    /// Write one response atomically. An encode failure is reported without
    /// touching the wire; IO failures leave the connection to the reader's
    /// judgement.
    pub(crate) async fn write_response(
        &self, header: &ResponseHeader, body: &[u8],
    ) -> io::Result<()> {
        let mut head_buf = Vec::with_capacity(64);
        if self.codec.encode_into(header, &mut head_buf).is_err() {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "response header encode"));
        }
        let frame = FrameHead::new(FRAME_RESPONSE, head_buf.len(), body.len());
        let wt = self.timeouts.effective_write();
        let mut w = self.writer.lock().await;
        use zerocopy::AsBytes;
        w.write_timeout(frame.as_bytes(), wt).await?;
        w.write_timeout(&head_buf, wt).await?;
        if !body.is_empty() {
            w.write_timeout(body, wt).await?;
        }
        w.flush_timeout(wt).await?;
        trace!("sent response seq={} {}B", header.seq, body.len());
        Ok(())
    }

    pub(crate) async fn shutdown(&self) {
        self.writer.lock().await.shutdown().await;
    }
}
