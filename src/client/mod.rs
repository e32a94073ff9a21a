//! The high-level client: selector-driven failover over per-endpoint
//! invokers, with the five fail modes of [FailMode].

mod conn;
use conn::Connector;
mod invoker;
pub use invoker::Invoker;
pub mod selector;
pub use selector::{
    ConsistentHashSelector, Endpoint, InvokerFactory, RandomSelector, RoundRobinSelector, Selector,
};

use std::sync::Arc;

use log::*;
use serde::de::DeserializeOwned;
use serde::Serialize;

use courier_rpc_core::error::{ErrorKind, RpcError};
use courier_rpc_core::{ClientConfig, Codec, FailMode};

use crate::plugin::ClientPluginContainer;

/// Completion channel endpoints for asynchronous calls. The sender side is
/// signaled exactly once per call with the [Call] itself.
pub type CallTx = crossfire::MTx<Call>;
pub type CallRx = crossfire::MAsyncRx<Call>;

/// Build a completion channel. A capacity of zero is a programming error
/// and panics, matching the contract that `done` must be buffered for the
/// number of calls that will share it.
pub fn done_channel(capacity: usize) -> (CallTx, CallRx) {
    if capacity == 0 {
        panic!("rpc: done channel is unbuffered");
    }
    crossfire::mpmc::bounded_tx_blocking_rx_async(capacity)
}

/// One in-flight invocation. Signaled exactly once by sending itself to
/// its done channel: on response, write failure, or connection teardown.
pub struct Call {
    pub service_method: String,
    /// Encoded reply body on success.
    pub reply: Option<Vec<u8>>,
    pub error: Option<RpcError>,
    done: Option<CallTx>,
}

impl Call {
    pub(crate) fn new(service_method: &str, done: CallTx) -> Self {
        Self {
            service_method: service_method.to_string(),
            reply: None,
            error: None,
            done: Some(done),
        }
    }

    /// Deliver the call to its receiver. A dropped receiver (a forking
    /// caller that already returned) is fine.
    pub(crate) fn done(mut self) {
        if let Some(tx) = self.done.take() {
            if tx.send(self).is_err() {
                trace!("call receiver dropped");
            }
        }
    }

    /// Decode the reply body into the caller's type.
    pub fn decode_reply<C: Codec, R: DeserializeOwned>(&self, codec: &C) -> Result<R, RpcError> {
        match &self.reply {
            Some(bytes) => codec.decode(bytes).map_err(|()| {
                RpcError::new(ErrorKind::ReadResponseBody, "ReadResponseBody: reply decode failed")
            }),
            None => Err(RpcError::new(ErrorKind::ReadResponseBody, "call has no reply body")),
        }
    }

    pub(crate) fn into_result<C: Codec, R: DeserializeOwned>(
        self, codec: &C, reply: &mut R,
    ) -> Result<(), RpcError> {
        if let Some(e) = self.error {
            return Err(e);
        }
        if let Some(bytes) = self.reply {
            *reply = codec.decode(&bytes).map_err(|()| {
                RpcError::new(ErrorKind::ReadResponseBody, "ReadResponseBody: reply decode failed")
            })?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "call {} err={:?}", self.service_method, self.error)
    }
}

/// RPC client over a selector. `call` applies the configured [FailMode];
/// `go` fires a single asynchronous invocation on one selected invoker.
pub struct Client<C: Codec, S: Selector<C>> {
    config: ClientConfig,
    codec: Arc<C>,
    selector: S,
}

impl<C: Codec, S: Selector<C>> Client<C, S> {
    pub fn new(config: ClientConfig, selector: S) -> Self {
        Self::with_plugins(config, selector, ClientPluginContainer::new())
    }

    pub fn with_plugins(
        mut config: ClientConfig, selector: S, plugins: ClientPluginContainer,
    ) -> Self {
        if config.max_try < 1 {
            config.max_try = 3;
        }
        let plugins = Arc::new(plugins);
        let connector = Connector::<C>::new(&config, plugins);
        let factory: InvokerFactory<C> = Arc::new(move |endpoint, dial_timeout| {
            let connector = connector.clone();
            Box::pin(async move { connector.connect(&endpoint, dial_timeout).await })
        });
        selector.set_invoker_factory(factory);
        Self { config, codec: Arc::new(C::default()), selector }
    }

    #[inline]
    pub fn selector(&self) -> &S {
        &self.selector
    }

    /// Invoke `service_method`, decode the reply into `reply`, applying the
    /// configured fail mode.
    pub async fn call<A, R>(
        &self, service_method: &str, args: &A, reply: &mut R,
    ) -> Result<(), RpcError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        match self.config.fail_mode {
            FailMode::Broadcast => self.call_broadcast(service_method, args, reply).await,
            FailMode::Forking => self.call_forking(service_method, args, reply).await,
            FailMode::Failfast => {
                let invoker = self.selector.select(service_method).await?;
                invoker.call(service_method, args, reply).await
            }
            FailMode::Failover => {
                let mut last_err = None;
                for _ in 0..self.config.max_try {
                    let invoker = match self.selector.select(service_method).await {
                        Ok(inv) => inv,
                        Err(e) => {
                            error!("failed to select an invoker: {}", e);
                            last_err = Some(e);
                            continue;
                        }
                    };
                    match invoker.call(service_method, args, reply).await {
                        Ok(()) => return Ok(()),
                        Err(e) => {
                            error!("failed to call: {}", e);
                            self.selector.handle_failed(&invoker);
                            last_err = Some(e);
                        }
                    }
                }
                Err(last_err.unwrap_or_else(|| RpcError::new(ErrorKind::Dial, "no invoker available")))
            }
            FailMode::Failtry => {
                let mut invoker = None;
                let mut last_err = None;
                for _ in 0..self.config.max_try {
                    if invoker.is_none() {
                        match self.selector.select(service_method).await {
                            Ok(inv) => invoker = Some(inv),
                            Err(e) => {
                                error!("failed to select an invoker: {}", e);
                                last_err = Some(e);
                                continue;
                            }
                        }
                    }
                    if let Some(inv) = invoker.as_ref() {
                        match inv.call(service_method, args, reply).await {
                            Ok(()) => return Ok(()),
                            Err(e) => {
                                error!("failed to call: {}", e);
                                self.selector.handle_failed(inv);
                                last_err = Some(e);
                            }
                        }
                    }
                }
                Err(last_err.unwrap_or_else(|| RpcError::new(ErrorKind::Dial, "no invoker available")))
            }
        }
    }

    /// All invokers, success only if every one succeeds. The reply is
    /// overwritten by each success in arrival order, no merge semantics.
    async fn call_broadcast<A, R>(
        &self, service_method: &str, args: &A, reply: &mut R,
    ) -> Result<(), RpcError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let invokers = self.selector.list().await;
        if invokers.is_empty() {
            info!("no invoker is available");
            return Ok(());
        }
        let body = self.encode_args(args)?;
        let n = invokers.len();
        let (tx, rx) = done_channel(n);
        futures::future::join_all(
            invokers.iter().map(|inv| inv.go_raw(service_method, body.clone(), tx.clone())),
        )
        .await;

        let mut last_ok: Option<Vec<u8>> = None;
        for _ in 0..n {
            match rx.recv().await {
                Err(_) => {
                    return Err(RpcError::new(
                        ErrorKind::Application,
                        "some invokers return Error",
                    ));
                }
                Ok(call) => {
                    if let Some(e) = &call.error {
                        warn!("failed to call: {}", e);
                        return Err(RpcError::new(
                            ErrorKind::Application,
                            "some invokers return Error",
                        ));
                    }
                    last_ok = call.reply;
                }
            }
        }
        if let Some(bytes) = last_ok {
            *reply = self.decode_reply(&bytes)?;
        }
        Ok(())
    }

    /// All invokers, first success wins; the laggards finish into a channel
    /// nobody reads anymore.
    async fn call_forking<A, R>(
        &self, service_method: &str, args: &A, reply: &mut R,
    ) -> Result<(), RpcError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let invokers = self.selector.list().await;
        if invokers.is_empty() {
            info!("no invoker is available");
            return Ok(());
        }
        let body = self.encode_args(args)?;
        let n = invokers.len();
        let (tx, rx) = done_channel(n);
        futures::future::join_all(
            invokers.iter().map(|inv| inv.go_raw(service_method, body.clone(), tx.clone())),
        )
        .await;

        for _ in 0..n {
            match rx.recv().await {
                Err(_) => break,
                Ok(call) => match call.error {
                    None => {
                        if let Some(bytes) = call.reply {
                            *reply = self.decode_reply(&bytes)?;
                        }
                        return Ok(());
                    }
                    Some(e) => warn!("failed to call: {}", e),
                },
            }
        }
        Err(RpcError::new(ErrorKind::Application, "all invokers return Error"))
    }

    /// Fire one asynchronous call on a selected invoker. The call signals
    /// `done` exactly once; selection and encode failures signal it
    /// immediately.
    pub async fn go<A: Serialize>(&self, service_method: &str, args: &A, done: CallTx) {
        let invoker = match self.selector.select(service_method).await {
            Ok(inv) => inv,
            Err(e) => {
                let mut call = Call::new(service_method, done);
                call.error = Some(e);
                call.done();
                return;
            }
        };
        match self.codec.encode(args) {
            Err(()) => {
                let mut call = Call::new(service_method, done);
                call.error = Some(RpcError::new(
                    ErrorKind::WriteRequest,
                    "WriteRequest: args encode failed",
                ));
                call.done();
            }
            Ok(body) => invoker.go_raw(service_method, body, done).await,
        }
    }

    /// Drain the selector: every invoker is marked failed, then closed.
    pub async fn close(&self) {
        for invoker in self.selector.list().await {
            self.selector.handle_failed(&invoker);
            invoker.close().await;
        }
    }

    #[inline]
    fn encode_args<A: Serialize>(&self, args: &A) -> Result<Vec<u8>, RpcError> {
        self.codec.encode(args).map_err(|()| {
            RpcError::new(ErrorKind::WriteRequest, "WriteRequest: args encode failed")
        })
    }

    #[inline]
    fn decode_reply<R: DeserializeOwned>(&self, bytes: &[u8]) -> Result<R, RpcError> {
        self.codec.decode(bytes).map_err(|()| {
            RpcError::new(ErrorKind::ReadResponseBody, "ReadResponseBody: reply decode failed")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "done channel is unbuffered")]
    fn test_unbuffered_done_channel_panics() {
        let _ = done_channel(0);
    }

    #[test]
    fn test_call_into_result() {
        use courier_rpc_codec::MsgpCodec;
        let codec = MsgpCodec::default();
        let (tx, _rx) = done_channel(1);
        let mut call = Call::new("/a/b", tx);
        call.reply = Some(codec.encode(&5u32).expect("encode"));
        let mut out = 0u32;
        call.into_result(&codec, &mut out).expect("ok");
        assert_eq!(out, 5);

        let (tx, _rx) = done_channel(1);
        let mut call = Call::new("/a/b", tx);
        call.error = Some(RpcError::shutdown());
        let mut out = 0u32;
        let err = call.into_result(&codec, &mut out).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionShutdown);
        assert_eq!(out, 0, "reply untouched on error");
    }
}
