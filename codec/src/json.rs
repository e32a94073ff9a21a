use crate::Codec;
use serde::{Deserialize, Serialize};

#[derive(Default)]
pub struct JsonCodec();

impl Codec for JsonCodec {
    #[inline(always)]
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ()> {
        match serde_json::to_vec(value) {
            Ok(buf) => return Ok(buf),
            Err(e) => {
                log::error!("json encode error: {:?}", e);
                return Err(());
            }
        }
    }

    fn encode_into<T: Serialize>(&self, value: &T, buf: &mut Vec<u8>) -> Result<usize, ()> {
        let pre_len = buf.len();
        if let Err(e) = serde_json::to_writer(&mut *buf, value) {
            log::error!("json encode error: {:?}", e);
            return Err(());
        } else {
            Ok(buf.len() - pre_len)
        }
    }

    #[inline(always)]
    fn decode<'a, T: Deserialize<'a>>(&self, buf: &'a [u8]) -> Result<T, ()> {
        match serde_json::from_slice::<T>(buf) {
            Err(e) => {
                log::warn!("json decode error: {:?}", e);
                return Err(());
            }
            Ok(v) => return Ok(v),
        }
    }
}
