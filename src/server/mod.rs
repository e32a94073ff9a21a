//! The server: accept loops, per-connection dispatch, response
//! serialization and the service registry.

mod context;
pub use context::RequestContext;
mod conn;
use conn::{HeadError, RespWriter, ServerCodecConn};

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::future::{AbortHandle, Abortable};
use log::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use courier_rpc_core::error::{ErrorKind, RpcError};
use courier_rpc_core::frame::{RequestHeader, ResponseHeader};
use courier_rpc_core::uri::check_name;
use courier_rpc_core::{Codec, ServerConfig, DEFAULT_RPC_PATH};

use crate::net::{NetListener, NetStream};
use crate::plugin::{ServerPlugin, ServerPluginContainer};
use crate::service::{RpcService, Service, ServiceBuilder};

/// Status line the server answers a CONNECT upgrade with; clients require
/// it before switching to the RPC protocol.
pub const CONNECTED: &str = "200 Connected to Courier RPC";

/// An RPC server generic over its payload codec.
///
/// Construct with [Server::new], register receivers, then [Server::listen].
/// Registration is meant to happen before serving; the registry itself is
/// reader-locked so late registration is possible but not the design
/// center.
pub struct Server<C: Codec> {
    inner: Arc<ServerInner<C>>,
    listeners: Mutex<Vec<(AbortHandle, String)>>,
}

struct ServerInner<C: Codec> {
    config: ServerConfig,
    plugins: ServerPluginContainer,
    builder: ServiceBuilder,
    registry: RwLock<HashMap<String, Arc<Service<C>>>>,
    routers: Mutex<Vec<String>>,
    ctx_pool: context::ContextPool,
    closed: AtomicBool,
}

impl<C: Codec> Server<C> {
    pub fn new(config: ServerConfig) -> Self {
        Self::with_parts(config, ServerPluginContainer::new(), ServiceBuilder::new())
    }

    /// Full-control constructor: global plugins and a custom service
    /// builder (URI format).
    pub fn with_parts(
        config: ServerConfig, plugins: ServerPluginContainer, builder: ServiceBuilder,
    ) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                config,
                plugins,
                builder,
                registry: RwLock::new(HashMap::new()),
                routers: Mutex::new(Vec::new()),
                ctx_pool: context::ContextPool::new(),
                closed: AtomicBool::new(false),
            }),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Register a receiver under its own name.
    pub fn register<S: RpcService<C>>(
        &self, receiver: Arc<S>, metadata: &[&str],
    ) -> Result<(), RpcError> {
        let name = receiver.service_name();
        self.register_name(name, receiver, metadata)
    }

    /// Like [Server::register] with an explicit name.
    pub fn register_name<S: RpcService<C>>(
        &self, name: &str, receiver: Arc<S>, metadata: &[&str],
    ) -> Result<(), RpcError> {
        check_name(name)?;
        self.inner.register_with(&[], name, receiver, ServerPluginContainer::new(), metadata)
    }

    /// Snapshot of every registered path, sorted.
    pub fn routers(&self) -> Vec<String> {
        self.inner.routers.lock().unwrap().clone()
    }

    /// Open a service group; services registered through it get the prefix
    /// prepended and the plugins attached at service scope.
    pub fn group(
        &self, prefix: &str, plugins: &[Arc<dyn ServerPlugin>],
    ) -> Result<ServiceGroup<C>, RpcError> {
        ServiceGroup {
            prefixes: Vec::new(),
            plugins: ServerPluginContainer::new(),
            server: self.inner.clone(),
        }
        .group(prefix, plugins)
    }

    /// Bind and start accepting in the background. Returns the actual
    /// local address, so binding port 0 is fine.
    pub async fn listen(&self, addr: &str) -> io::Result<String> {
        self.spawn_listener(addr, None).await
    }

    /// Like [Server::listen], but each connection must first perform the
    /// HTTP CONNECT upgrade on `rpc_path` (default [DEFAULT_RPC_PATH]).
    pub async fn listen_http(&self, addr: &str, rpc_path: Option<&str>) -> io::Result<String> {
        let path = rpc_path.unwrap_or(DEFAULT_RPC_PATH).to_string();
        self.spawn_listener(addr, Some(path)).await
    }

    async fn spawn_listener(&self, addr: &str, http_path: Option<String>) -> io::Result<String> {
        let listener = NetListener::bind_str(addr).await?;
        let local = listener.local_addr()?;
        if self.inner.config.router_printable {
            info!("[RPC] listening and serving on {}", local);
        }
        let (abort_handle, reg) = AbortHandle::new_pair();
        self.listeners.lock().unwrap().push((abort_handle, local.clone()));
        let inner = self.inner.clone();
        let accept_loop = Abortable::new(
            async move {
                inner.accept_loop(listener, http_path).await;
            },
            reg,
        );
        tokio::spawn(async move {
            if accept_loop.await.is_err() {
                debug!("[RPC] accept loop stopped");
            }
        });
        Ok(local)
    }

    /// Stop listening. In-flight connections and handlers finish naturally.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let mut listeners = self.listeners.lock().unwrap();
        for (handle, info) in listeners.drain(..) {
            handle.abort();
            info!("[RPC] stopped listening on {}", info);
        }
    }
}

impl<C: Codec> ServerInner<C> {
    fn register_with<S: RpcService<C>>(
        &self, prefixes: &[&str], name: &str, receiver: Arc<S>,
        service_plugins: ServerPluginContainer, metadata: &[&str],
    ) -> Result<(), RpcError> {
        let services = self.builder.build(name, receiver, prefixes)?;
        let metadata: Vec<String> = metadata.iter().map(|m| m.to_string()).collect();
        let mut registry = self.registry.write().unwrap();
        let mut routers = self.routers.lock().unwrap();
        for mut service in services {
            let path = service.path().to_string();
            if registry.contains_key(&path) {
                return Err(RpcError::new(
                    ErrorKind::Application,
                    format!("service already registered: {}", path),
                ));
            }
            self.plugins.do_register(&path, &metadata)?;
            service_plugins.do_register(&path, &metadata)?;
            service.set_plugins(service_plugins.clone());
            if self.config.router_printable {
                info!("[RPC ROUTER] {}", path);
            }
            routers.push(path.clone());
            registry.insert(path, Arc::new(service));
        }
        routers.sort();
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: NetListener, http_path: Option<String>) {
        debug!("[RPC] {}", listener);
        loop {
            match listener.accept().await {
                Err(e) => {
                    // a closing server aborts this task; anything else that
                    // still surfaces after close is not worth logging
                    if !self.closed.load(Ordering::Acquire) {
                        info!("[RPC] accept: {}", e);
                    }
                    return;
                }
                Ok(stream) => match &http_path {
                    None => {
                        let stream = match self.plugins.do_post_conn_accept(stream) {
                            Ok(s) => s,
                            Err(e) => {
                                info!("[RPC] PostConnAccept: {}", e);
                                continue;
                            }
                        };
                        let server = self.clone();
                        tokio::spawn(async move {
                            server.serve_conn(stream).await;
                        });
                    }
                    Some(path) => {
                        let server = self.clone();
                        let path = path.clone();
                        tokio::spawn(async move {
                            server.serve_http_conn(stream, path).await;
                        });
                    }
                },
            }
        }
    }

    /// Drive the CONNECT upgrade, then hand the raw stream to the normal
    /// per-connection loop.
    async fn serve_http_conn(self: Arc<Self>, mut stream: NetStream, rpc_path: String) {
        let head = match read_http_head(&mut stream, self.config.timeouts.effective_read()).await {
            Ok(h) => h,
            Err(e) => {
                debug!("[RPC] http handshake: {}", e);
                return;
            }
        };
        let line = head.lines().next().unwrap_or("");
        let mut parts = line.split_whitespace();
        let method = parts.next().unwrap_or("");
        let path = parts.next().unwrap_or("");
        if method != "CONNECT" {
            let _ = stream
                .write_all(
                    b"HTTP/1.0 405 Method Not Allowed\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n405 must CONNECT\n",
                )
                .await;
            return;
        }
        if path != rpc_path {
            let _ = stream.write_all(b"HTTP/1.0 404 Not Found\r\n\r\n").await;
            return;
        }
        let mut stream = match self.plugins.do_post_conn_accept(stream) {
            Ok(s) => s,
            Err(e) => {
                info!("[RPC] PostConnAccept: {}", e);
                return;
            }
        };
        if let Err(e) = stream.write_all(format!("HTTP/1.0 {}\n\n", CONNECTED).as_bytes()).await {
            debug!("[RPC] http connected reply: {}", e);
            return;
        }
        self.serve_conn(stream).await;
    }

    /// Per-connection dispatch: strictly sequential reads, one spawned task
    /// per request, responses rejoining through the shared write lock.
    async fn serve_conn(self: Arc<Self>, stream: NetStream) {
        let remote = stream.peer_label();
        let mut conn = ServerCodecConn::<C>::bind(stream, self.config.timeouts);
        debug!("[RPC] serving {}", remote);
        loop {
            let mut ctx = self.ctx_pool.get(&remote);

            if let Err(e) = self.plugins.do_pre_read_request_header(&mut ctx) {
                debug!("[RPC] PreReadRequestHeader: {}", e);
                self.ctx_pool.put(ctx);
                break;
            }
            let frame = match conn.read_request_frame().await {
                Ok(f) => f,
                Err(HeadError::Eof) => {
                    trace!("[RPC] {} closed", remote);
                    self.ctx_pool.put(ctx);
                    break;
                }
                Err(HeadError::Io(e)) => {
                    debug!("[RPC] {} read: {}", remote, e);
                    self.ctx_pool.put(ctx);
                    break;
                }
                Err(HeadError::Frame(e)) => {
                    debug!("[RPC] {}: {}", remote, e);
                    self.ctx_pool.put(ctx);
                    break;
                }
            };
            let header_len = frame.header_len.get() as usize;
            let body_len = frame.body_len.get() as usize;

            let rt = self.config.timeouts.effective_read();
            let header: RequestHeader = {
                let buf = match conn.reader.read_payload(header_len, rt).await {
                    Ok(b) => b,
                    Err(e) => {
                        debug!("[RPC] {} read header: {}", remote, e);
                        self.ctx_pool.put(ctx);
                        break;
                    }
                };
                match conn.codec.decode(buf) {
                    Ok(h) => h,
                    Err(()) => {
                        // seq unknown, nothing sensible to answer
                        debug!("[RPC] {} ReadRequestHeader: header decode failed", remote);
                        self.ctx_pool.put(ctx);
                        break;
                    }
                }
            };
            ctx.seq = header.seq;
            ctx.service_method = header.service_method;

            // The header parsed; from here every failure is answered with
            // an error response and the connection keeps reading.
            match self.builder.format().parse(&ctx.service_method) {
                Ok((path, query)) => {
                    ctx.path = path;
                    ctx.query = query;
                }
                Err(e) => {
                    self.fail_request(&mut conn, ctx, body_len, e).await;
                    continue;
                }
            }
            if let Err(e) = self.plugins.do_post_read_request_header(&mut ctx) {
                let e = rekind(ErrorKind::PostReadRequestHeader, e);
                self.fail_request(&mut conn, ctx, body_len, e).await;
                continue;
            }

            let service = { self.registry.read().unwrap().get(&ctx.path).cloned() };
            let service = match service {
                Some(s) => s,
                None => {
                    let e = RpcError::new(
                        ErrorKind::NotFoundService,
                        format!("can't find service '{}'", ctx.path),
                    );
                    self.fail_request(&mut conn, ctx, body_len, e).await;
                    continue;
                }
            };

            let mut pre = self.plugins.do_pre_read_request_body(&mut ctx);
            if pre.is_ok() {
                pre = service.plugins().do_pre_read_request_body(&mut ctx);
            }
            if let Err(e) = pre {
                let e = rekind(ErrorKind::PreReadRequestBody, e);
                self.fail_request(&mut conn, ctx, body_len, e).await;
                continue;
            }

            let body = match conn.reader.read_payload(body_len, rt).await {
                Ok(b) => b,
                Err(e) => {
                    debug!("[RPC] {} read body: {}", remote, e);
                    self.ctx_pool.put(ctx);
                    break;
                }
            };

            let mut post = service.plugins().do_post_read_request_body(&mut ctx, body);
            if post.is_ok() {
                post = self.plugins.do_post_read_request_body(&mut ctx, body);
            }
            if let Err(e) = post {
                let e = rekind(ErrorKind::PostReadRequestBody, e);
                self.send_response(&conn.resp, ctx, Some(&service), Err(e)).await;
                continue;
            }

            let argv = match service.decode_arg(&conn.codec, body) {
                Ok(v) => v,
                Err(()) => {
                    let e = RpcError::new(
                        ErrorKind::ReadRequestBody,
                        "ReadRequestBody: body decode failed",
                    );
                    self.send_response(&conn.resp, ctx, Some(&service), Err(e)).await;
                    continue;
                }
            };

            let server = self.clone();
            let resp = conn.resp.clone();
            let codec = conn.codec.clone();
            tokio::spawn(async move {
                let result = service.invoke(argv, codec).await;
                server.send_response(&resp, ctx, Some(&service), result).await;
            });
        }
        conn.resp.shutdown().await;
    }

    /// Recoverable request failure: drain the announced body, answer with
    /// an error response, keep the connection.
    async fn fail_request(
        &self, conn: &mut ServerCodecConn<C>, ctx: Box<RequestContext>, body_len: usize,
        err: RpcError,
    ) {
        if body_len > 0 {
            let rt = self.config.timeouts.effective_read();
            if let Err(e) = conn.reader.discard(body_len, rt).await {
                debug!("[RPC] {} drain body: {}", ctx.remote_addr(), e);
            }
        }
        debug!("[RPC] {}: {}", ctx.id(), err);
        self.send_response(&conn.resp, ctx, None, Err(err)).await;
    }

    /// Serialize one response through the connection's write lock and
    /// recycle the context. Error results become an empty placeholder body
    /// with the kind-prefixed error string on the header.
    async fn send_response(
        &self, resp: &RespWriter<C>, mut ctx: Box<RequestContext>,
        service: Option<&Arc<Service<C>>>, result: Result<Vec<u8>, RpcError>,
    ) {
        let (mut error_string, mut body) = match result {
            Ok(body) => (String::new(), body),
            Err(e) => (e.to_wire(), Vec::new()),
        };

        let mut pre = self.plugins.do_pre_write_response(&mut ctx, &body);
        if pre.is_ok() {
            if let Some(svc) = service {
                pre = svc.plugins().do_pre_write_response(&mut ctx, &body);
            }
        }
        if let Err(e) = pre {
            debug!("[RPC] PreWriteResponse: {}", e);
            error_string = rekind(ErrorKind::PreWriteResponse, e).to_wire();
            body.clear();
        }

        let header = ResponseHeader {
            seq: ctx.seq,
            service_method: ctx.service_method.clone(),
            error: error_string,
        };
        if let Err(e) = resp.write_response(&header, &body).await {
            debug!("[RPC] WriteResponse: {}", e);
        }

        // post-write hook failures are logged, never surfaced
        let mut post = match service {
            Some(svc) => svc.plugins().do_post_write_response(&mut ctx, &body),
            None => Ok(()),
        };
        if post.is_ok() {
            post = self.plugins.do_post_write_response(&mut ctx, &body);
        }
        if let Err(e) = post {
            debug!("[RPC] PostWriteResponse: {}", e);
        }
        self.ctx_pool.put(ctx);
    }
}

#[inline]
fn rekind(kind: ErrorKind, e: RpcError) -> RpcError {
    RpcError::new(kind, e.message())
}

/// Read the upgrade request up to the blank line, byte by byte; the
/// handshake is tiny and must not consume anything past it.
async fn read_http_head(stream: &mut NetStream, read_timeout: Duration) -> io::Result<String> {
    const MAX_HEAD: usize = 4096;
    let mut head: Vec<u8> = Vec::with_capacity(128);
    let fill = async {
        let mut byte = [0u8; 1];
        loop {
            stream.read_exact(&mut byte).await?;
            head.push(byte[0]);
            if head.len() > MAX_HEAD {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "handshake too large"));
            }
            if head.ends_with(b"\n\n") || head.ends_with(b"\r\n\r\n") {
                return Ok(());
            }
        }
    };
    if read_timeout == Duration::from_secs(0) {
        fill.await?;
    } else {
        match tokio::time::timeout(read_timeout, fill).await {
            Ok(r) => r?,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

/// A registration scope carrying path prefixes and service-scoped plugins;
/// child groups and services inherit both additively.
pub struct ServiceGroup<C: Codec> {
    prefixes: Vec<String>,
    plugins: ServerPluginContainer,
    server: Arc<ServerInner<C>>,
}

impl<C: Codec> ServiceGroup<C> {
    pub fn group(
        &self, prefix: &str, plugins: &[Arc<dyn ServerPlugin>],
    ) -> Result<ServiceGroup<C>, RpcError> {
        check_name(prefix)?;
        let mut inherited = self.plugins.clone();
        for p in plugins {
            inherited.add(p.clone());
        }
        let mut prefixes = self.prefixes.clone();
        prefixes.push(prefix.to_string());
        Ok(ServiceGroup { prefixes, plugins: inherited, server: self.server.clone() })
    }

    pub fn register<S: RpcService<C>>(
        &self, receiver: Arc<S>, metadata: &[&str],
    ) -> Result<(), RpcError> {
        let name = receiver.service_name();
        self.register_name(name, receiver, metadata)
    }

    pub fn register_name<S: RpcService<C>>(
        &self, name: &str, receiver: Arc<S>, metadata: &[&str],
    ) -> Result<(), RpcError> {
        check_name(name)?;
        let prefixes: Vec<&str> = self.prefixes.iter().map(|s| s.as_str()).collect();
        self.server.register_with(&prefixes, name, receiver, self.plugins.clone(), metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::MethodTable;
    use courier_rpc_codec::MsgpCodec;
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex as StdMutex;

    #[derive(Serialize, Deserialize, Debug, Default)]
    struct Echo {
        v: u32,
    }

    struct EchoSvc;

    impl RpcService<MsgpCodec> for EchoSvc {
        fn service_name(&self) -> &'static str {
            "Echo"
        }

        fn methods(table: &mut MethodTable<Self, MsgpCodec>) {
            table.method("Ping", |_s, args: Echo| async move { Ok::<_, String>(args) });
        }
    }

    #[test]
    fn test_registry_uniqueness() {
        let server: Server<MsgpCodec> = Server::new(ServerConfig::default());
        server.register(Arc::new(EchoSvc), &[]).expect("first registration");
        let err = server.register(Arc::new(EchoSvc), &[]).unwrap_err();
        assert!(err.message().contains("already registered"), "got: {}", err);
        // the first registration is still routed
        assert_eq!(server.routers(), vec!["/echo/ping".to_string()]);
    }

    #[test]
    fn test_register_name_and_routers_sorted() {
        let server: Server<MsgpCodec> = Server::new(ServerConfig::default());
        server.register_name("Zeta", Arc::new(EchoSvc), &[]).expect("register");
        server.register_name("Alpha", Arc::new(EchoSvc), &[]).expect("register");
        assert_eq!(
            server.routers(),
            vec!["/alpha/ping".to_string(), "/zeta/ping".to_string()]
        );
        assert!(server.register_name("bad name", Arc::new(EchoSvc), &[]).is_err());
    }

    struct RegisterSpy {
        log: Arc<StdMutex<Vec<String>>>,
        tag: &'static str,
    }

    impl ServerPlugin for RegisterSpy {
        fn name(&self) -> &str {
            self.tag
        }

        fn register(&self, path: &str, metadata: &[String]) -> Result<(), RpcError> {
            self.log.lock().unwrap().push(format!("{}:{}:{}", self.tag, path, metadata.join(",")));
            Ok(())
        }
    }

    #[test]
    fn test_group_inherits_plugins_additively() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let server: Server<MsgpCodec> = Server::new(ServerConfig::default());
        let outer_spy: Arc<dyn ServerPlugin> =
            Arc::new(RegisterSpy { log: log.clone(), tag: "outer" });
        let inner_spy: Arc<dyn ServerPlugin> =
            Arc::new(RegisterSpy { log: log.clone(), tag: "inner" });
        let outer = server.group("calc", &[outer_spy]).expect("group");
        let inner = outer.group("v1", &[inner_spy]).expect("group");
        inner.register(Arc::new(EchoSvc), &["meta"]).expect("register");

        assert_eq!(server.routers(), vec!["/calc/v1/echo/ping".to_string()]);
        // both scoped plugins saw the registration, parent first
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "outer:/calc/v1/echo/ping:meta".to_string(),
                "inner:/calc/v1/echo/ping:meta".to_string()
            ]
        );
    }
}
