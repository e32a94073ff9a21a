//! # courier-rpc-codec
//!
//! [courier_rpc_core::Codec] implementations for
//! [`courier-rpc`](https://docs.rs/courier-rpc). Msgpack is the default
//! codec of the framework; json is handy when wire payloads need to be
//! human-readable.

pub use courier_rpc_core::Codec;
mod msgpack;
pub use msgpack::MsgpCodec;
mod json;
pub use json::JsonCodec;
