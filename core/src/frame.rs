//! Wire layout shared by the default codec stack.
//!
//! Every message is a fixed [FrameHead] preamble followed by two
//! codec-encoded sections: the header ([RequestHeader] or [ResponseHeader])
//! and the body. The preamble carries the section lengths so a peer can
//! always drain a message it cannot interpret.

use serde::{Deserialize, Serialize};
use std::mem::size_of;
use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

pub const FRAME_MAGIC: [u8; 2] = [b'C', b'R'];
pub const FRAME_VER: u8 = 1;

/// Frame kinds; a server only accepts requests, a client only responses.
pub const FRAME_REQUEST: u8 = 0;
pub const FRAME_RESPONSE: u8 = 1;

/// Upper bound for one encoded section, rejects garbage lengths early.
pub const MAX_SECTION_LEN: u32 = 64 * 1024 * 1024;

/// Fixed len of FrameHead = 12B
/// | 2B   |1B | 1B  |     4B    |   4B   |
/// | magic|ver| kind| header_len|body_len|
#[derive(AsBytes, FromBytes, FromZeroes, Unaligned, Debug, PartialEq, Clone, Copy)]
#[repr(C)]
pub struct FrameHead {
    pub magic: [u8; 2],
    pub ver: u8,
    pub kind: u8,
    pub header_len: U32<LittleEndian>,
    pub body_len: U32<LittleEndian>,
}

pub const FRAME_HEAD_LEN: usize = size_of::<FrameHead>();

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum FrameError {
    #[error("bad frame magic {0:?}")]
    Magic([u8; 2]),
    #[error("frame version {0} not supported")]
    Version(u8),
    #[error("unexpected frame kind {0}")]
    Kind(u8),
    #[error("frame section of {0} bytes exceeds the limit")]
    Oversize(u32),
}

impl FrameHead {
    #[inline]
    pub fn new(kind: u8, header_len: usize, body_len: usize) -> Self {
        Self {
            magic: FRAME_MAGIC,
            ver: FRAME_VER,
            kind,
            header_len: U32::new(header_len as u32),
            body_len: U32::new(body_len as u32),
        }
    }

    /// Parse and validate a preamble, checking it announces `expect_kind`.
    pub fn decode(buf: &[u8; FRAME_HEAD_LEN], expect_kind: u8) -> Result<Self, FrameError> {
        let head = Self::read_from(&buf[..]).expect("frame head size");
        if head.magic != FRAME_MAGIC {
            return Err(FrameError::Magic(head.magic));
        }
        if head.ver != FRAME_VER {
            return Err(FrameError::Version(head.ver));
        }
        if head.kind != expect_kind {
            return Err(FrameError::Kind(head.kind));
        }
        for len in [head.header_len.get(), head.body_len.get()] {
            if len > MAX_SECTION_LEN {
                return Err(FrameError::Oversize(len));
            }
        }
        Ok(head)
    }
}

/// Header of one request, codec-encoded right after the frame preamble.
///
/// `seq` is assigned by the client and is only unique within a single
/// connection; `service_method` is the URL-form identifier.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct RequestHeader {
    pub seq: u64,
    pub service_method: String,
}

/// Header of one response. A non-empty `error` marks the call as failed and
/// the body is a placeholder that must not be decoded.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct ResponseHeader {
    pub seq: u64,
    pub service_method: String,
    pub error: String,
}
