//! # courier-rpc-core
//!
//! Shared building blocks for [`courier-rpc`](https://docs.rs/courier-rpc):
//! the error taxonomy with its numeric wire codes, the payload [Codec]
//! trait, the wire frame layout, timeout/config structs and the
//! service-method URI format.

mod codec;
pub use codec::Codec;
mod config;
pub use config::{ClientConfig, FailMode, ServerConfig, TimeoutSetting, DEFAULT_RPC_PATH};
pub mod error;
pub mod frame;
pub mod uri;
