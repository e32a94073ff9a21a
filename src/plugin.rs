//! Hook points around every I/O step and connection event.
//!
//! A plugin implements the subset of hooks it cares about; the rest fall
//! through to no-op defaults. Containers fire hooks in registration order
//! and stop at the first error. Connection-level hooks take the stream by
//! value so a plugin can hand back a wrapped replacement.

use std::sync::Arc;

use courier_rpc_core::error::RpcError;
use courier_rpc_core::frame::{RequestHeader, ResponseHeader};

use crate::net::NetStream;
use crate::server::RequestContext;

/// Server-side hooks. The body slices are the codec-encoded bytes of the
/// request body or response body.
#[allow(unused_variables)]
pub trait ServerPlugin: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Fired for every accepted connection, before the codec binds. May
    /// return a different stream to substitute the connection.
    fn post_conn_accept(&self, conn: NetStream) -> Result<NetStream, RpcError> {
        Ok(conn)
    }

    fn pre_read_request_header(&self, ctx: &mut RequestContext) -> Result<(), RpcError> {
        Ok(())
    }

    fn post_read_request_header(&self, ctx: &mut RequestContext) -> Result<(), RpcError> {
        Ok(())
    }

    fn pre_read_request_body(&self, ctx: &mut RequestContext) -> Result<(), RpcError> {
        Ok(())
    }

    fn post_read_request_body(&self, ctx: &mut RequestContext, body: &[u8]) -> Result<(), RpcError> {
        Ok(())
    }

    fn pre_write_response(&self, ctx: &mut RequestContext, body: &[u8]) -> Result<(), RpcError> {
        Ok(())
    }

    fn post_write_response(&self, ctx: &mut RequestContext, body: &[u8]) -> Result<(), RpcError> {
        Ok(())
    }

    /// Fired when a service path is registered.
    fn register(&self, path: &str, metadata: &[String]) -> Result<(), RpcError> {
        Ok(())
    }
}

/// Client-side hooks, mirroring the write/read steps of one call.
#[allow(unused_variables)]
pub trait ClientPlugin: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Fired right after dialing. May return a different stream to
    /// substitute the connection.
    fn post_connected(&self, conn: NetStream) -> Result<NetStream, RpcError> {
        Ok(conn)
    }

    fn pre_write_request(&self, header: &RequestHeader, body: &[u8]) -> Result<(), RpcError> {
        Ok(())
    }

    fn post_write_request(&self, header: &RequestHeader, body: &[u8]) -> Result<(), RpcError> {
        Ok(())
    }

    fn pre_read_response_header(&self) -> Result<(), RpcError> {
        Ok(())
    }

    fn post_read_response_header(&self, header: &ResponseHeader) -> Result<(), RpcError> {
        Ok(())
    }

    fn pre_read_response_body(&self, header: &ResponseHeader) -> Result<(), RpcError> {
        Ok(())
    }

    fn post_read_response_body(
        &self, header: &ResponseHeader, body: &[u8],
    ) -> Result<(), RpcError> {
        Ok(())
    }
}

macro_rules! fire_all {
    ($plugins:expr, $hook:ident ( $($arg:expr),* )) => {
        for p in $plugins.iter() {
            p.$hook($($arg),*)?;
        }
    };
}

/// Ordered server plugin list. Built before the server starts and immutable
/// afterwards; groups clone it to inherit plugins additively.
#[derive(Clone, Default)]
pub struct ServerPluginContainer {
    plugins: Vec<Arc<dyn ServerPlugin>>,
}

impl ServerPluginContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, plugin: Arc<dyn ServerPlugin>) -> &mut Self {
        self.plugins.push(plugin);
        self
    }

    #[inline]
    pub fn plugins(&self) -> &[Arc<dyn ServerPlugin>] {
        &self.plugins
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub(crate) fn do_post_conn_accept(&self, mut conn: NetStream) -> Result<NetStream, RpcError> {
        for p in self.plugins.iter() {
            conn = p.post_conn_accept(conn)?;
        }
        Ok(conn)
    }

    pub(crate) fn do_pre_read_request_header(
        &self, ctx: &mut RequestContext,
    ) -> Result<(), RpcError> {
        fire_all!(self.plugins, pre_read_request_header(ctx));
        Ok(())
    }

    pub(crate) fn do_post_read_request_header(
        &self, ctx: &mut RequestContext,
    ) -> Result<(), RpcError> {
        fire_all!(self.plugins, post_read_request_header(ctx));
        Ok(())
    }

    pub(crate) fn do_pre_read_request_body(
        &self, ctx: &mut RequestContext,
    ) -> Result<(), RpcError> {
        fire_all!(self.plugins, pre_read_request_body(ctx));
        Ok(())
    }

    pub(crate) fn do_post_read_request_body(
        &self, ctx: &mut RequestContext, body: &[u8],
    ) -> Result<(), RpcError> {
        fire_all!(self.plugins, post_read_request_body(ctx, body));
        Ok(())
    }

    pub(crate) fn do_pre_write_response(
        &self, ctx: &mut RequestContext, body: &[u8],
    ) -> Result<(), RpcError> {
        fire_all!(self.plugins, pre_write_response(ctx, body));
        Ok(())
    }

    pub(crate) fn do_post_write_response(
        &self, ctx: &mut RequestContext, body: &[u8],
    ) -> Result<(), RpcError> {
        fire_all!(self.plugins, post_write_response(ctx, body));
        Ok(())
    }

    pub(crate) fn do_register(&self, path: &str, metadata: &[String]) -> Result<(), RpcError> {
        fire_all!(self.plugins, register(path, metadata));
        Ok(())
    }
}

/// Ordered client plugin list shared by every invoker of a client.
#[derive(Clone, Default)]
pub struct ClientPluginContainer {
    plugins: Vec<Arc<dyn ClientPlugin>>,
}

impl ClientPluginContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, plugin: Arc<dyn ClientPlugin>) -> &mut Self {
        self.plugins.push(plugin);
        self
    }

    #[inline]
    pub fn plugins(&self) -> &[Arc<dyn ClientPlugin>] {
        &self.plugins
    }

    pub(crate) fn do_post_connected(&self, mut conn: NetStream) -> Result<NetStream, RpcError> {
        for p in self.plugins.iter() {
            conn = p.post_connected(conn)?;
        }
        Ok(conn)
    }

    pub(crate) fn do_pre_write_request(
        &self, header: &RequestHeader, body: &[u8],
    ) -> Result<(), RpcError> {
        fire_all!(self.plugins, pre_write_request(header, body));
        Ok(())
    }

    pub(crate) fn do_post_write_request(
        &self, header: &RequestHeader, body: &[u8],
    ) -> Result<(), RpcError> {
        fire_all!(self.plugins, post_write_request(header, body));
        Ok(())
    }

    pub(crate) fn do_pre_read_response_header(&self) -> Result<(), RpcError> {
        fire_all!(self.plugins, pre_read_response_header());
        Ok(())
    }

    pub(crate) fn do_post_read_response_header(
        &self, header: &ResponseHeader,
    ) -> Result<(), RpcError> {
        fire_all!(self.plugins, post_read_response_header(header));
        Ok(())
    }

    pub(crate) fn do_pre_read_response_body(
        &self, header: &ResponseHeader,
    ) -> Result<(), RpcError> {
        fire_all!(self.plugins, pre_read_response_body(header));
        Ok(())
    }

    pub(crate) fn do_post_read_response_body(
        &self, header: &ResponseHeader, body: &[u8],
    ) -> Result<(), RpcError> {
        fire_all!(self.plugins, post_read_response_body(header, body));
        Ok(())
    }
}
