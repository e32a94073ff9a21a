use crate::Codec;
use serde::{Deserialize, Serialize};

#[derive(Default)]
pub struct MsgpCodec();

impl Codec for MsgpCodec {
    #[inline(always)]
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ()> {
        match rmp_serde::encode::to_vec_named(value) {
            Ok(buf) => return Ok(buf),
            Err(e) => {
                log::error!("msgpack encode error: {:?}", e);
                return Err(());
            }
        }
    }

    fn encode_into<T: Serialize>(&self, value: &T, buf: &mut Vec<u8>) -> Result<usize, ()> {
        let pre_len = buf.len();
        if let Err(e) = rmp_serde::encode::write_named(buf, value) {
            log::error!("msgpack encode error: {:?}", e);
            return Err(());
        } else {
            Ok(buf.len() - pre_len)
        }
    }

    #[inline(always)]
    fn decode<'a, T: Deserialize<'a>>(&self, buf: &'a [u8]) -> Result<T, ()> {
        match rmp_serde::decode::from_slice::<T>(buf) {
            Err(e) => {
                log::warn!("msgpack decode error: {:?}", e);
                return Err(());
            }
            Ok(v) => return Ok(v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Pair {
        a: i32,
        b: String,
    }

    #[test]
    fn test_msgp() {
        let codec = MsgpCodec::default();
        let v = Pair { a: 7, b: "eight".to_string() };
        let encoded = codec.encode(&v).expect("encode");
        let decoded: Pair = codec.decode(&encoded).expect("decode");
        assert_eq!(decoded, v);

        let mut buf = Vec::new();
        let n = codec.encode_into(&v, &mut buf).expect("encode_into");
        assert_eq!(n, buf.len());
        assert_eq!(buf, encoded);
    }

    #[test]
    fn test_msgp_decode_garbage() {
        let codec = MsgpCodec::default();
        let r: Result<Pair, ()> = codec.decode(&[0xc1, 0x00, 0xff]);
        assert!(r.is_err());
    }
}
