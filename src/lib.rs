//! # courier-rpc
//!
//! A codec-pluggable RPC framework: URL-style routing of service methods on
//! the server, plugin hooks around every I/O step, and a client that fails
//! over across multiple endpoints through pluggable selectors.
//!
//! ## Components
//!
//! - [server::Server]: accept loop, per-connection dispatch with concurrent
//!   handlers, serialized response writes, pooled request contexts.
//! - [service]: receivers declare methods into a table; every method
//!   becomes one routable [service::Service] at
//!   `/<group..>/<name>/<method>`.
//! - [client::Client]: `call`/`go` with five fail modes
//!   (failover/failfast/failtry/broadcast/forking) over
//!   [client::Selector]-managed invokers.
//! - [plugin]: hook containers fired in registration order on both sides.
//! - Payload codecs implement [Codec];
//!   [`courier-rpc-codec`](https://docs.rs/courier-rpc-codec) ships msgpack
//!   (the default choice) and json.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use courier_rpc::client::{Client, Endpoint, RoundRobinSelector};
//! use courier_rpc::server::Server;
//! use courier_rpc::service::{MethodTable, RpcService};
//! use courier_rpc::{ClientConfig, MsgpCodec, ServerConfig};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, Default)]
//! struct Args {
//!     a: i32,
//!     b: i32,
//! }
//!
//! #[derive(Serialize, Deserialize, Default)]
//! struct Reply {
//!     c: i32,
//! }
//!
//! struct Arith;
//!
//! impl RpcService<MsgpCodec> for Arith {
//!     fn service_name(&self) -> &'static str {
//!         "Arith"
//!     }
//!
//!     fn methods(table: &mut MethodTable<Self, MsgpCodec>) {
//!         table.method("Mul", |_s, args: Args| async move {
//!             Ok::<_, String>(Reply { c: args.a * args.b })
//!         });
//!     }
//! }
//!
//! async fn run() -> Result<(), Box<dyn std::error::Error>> {
//!     let server: Server<MsgpCodec> = Server::new(ServerConfig::default());
//!     server.register(Arc::new(Arith), &[])?;
//!     let addr = server.listen("127.0.0.1:0").await?;
//!
//!     let selector = RoundRobinSelector::new(vec![Endpoint::tcp(&addr)], vec![]);
//!     let client: Client<MsgpCodec, _> = Client::new(ClientConfig::default(), selector);
//!     let mut reply = Reply::default();
//!     client.call("/arith/mul", &Args { a: 7, b: 8 }, &mut reply).await?;
//!     assert_eq!(reply.c, 56);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod net;
pub mod plugin;
pub mod server;
pub mod service;

pub use courier_rpc_codec::{JsonCodec, MsgpCodec};
pub use courier_rpc_core::error::{ErrorKind, RpcError};
pub use courier_rpc_core::frame::{RequestHeader, ResponseHeader};
pub use courier_rpc_core::uri::{Query, UriFormat, UrlFormat};
pub use courier_rpc_core::{
    ClientConfig, Codec, FailMode, ServerConfig, TimeoutSetting, DEFAULT_RPC_PATH,
};
