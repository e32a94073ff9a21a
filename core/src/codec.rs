use serde::{Deserialize, Serialize};

/// Payload encoder/decoder bound to a connection.
///
/// Implementations live in [courier-rpc-codec](https://docs.rs/courier-rpc-codec).
/// One instance is created per connection and shared by its reader and
/// writer; a codec carrying state (e.g. a cipher) should use inner
/// mutability.
///
/// Both headers and bodies go through this trait, so anything a service
/// method takes or returns only has to be serde-compatible. Failures are
/// expected to be logged by the implementation; the framework maps them to
/// its own error kinds at the call site.
pub trait Codec: Default + Send + Sync + Sized + 'static {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ()>;

    /// Serialize `value` onto the end of `buf`, returning the number of
    /// bytes written.
    fn encode_into<T: Serialize>(&self, value: &T, buf: &mut Vec<u8>) -> Result<usize, ()>;

    fn decode<'a, T: Deserialize<'a>>(&self, buf: &'a [u8]) -> Result<T, ()>;
}
