//! Dataport transport-packet codec.
//!
//! Frame layout is `flags(u8) | payload-length(u32 BE) | payload`. The flags
//! byte selects the payload encoding; only JSON is defined today. Receive
//! blocks until one full frame is buffered or the stream fails; frames above
//! the configured cap are rejected before their payload is read.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::payload::DataportPayload;

pub const FLAG_ENC_JSON: u8 = 0x1;
const HEADER_LEN: usize = 5;

/// Codec for dataport frames.
#[derive(Clone, Copy, Debug)]
pub struct DataportCodec {
    max_payload: usize,
}

impl DataportCodec {
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }
}

impl Decoder for DataportCodec {
    type Item = DataportPayload;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<DataportPayload>, io::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let flags = src[0];
        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if len > self.max_payload {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("payload of {len} bytes exceeds cap {}", self.max_payload),
            ));
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }
        src.advance(HEADER_LEN);
        let payload = src.split_to(len);
        if flags != FLAG_ENC_JSON {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown payload encoding {flags:#x}"),
            ));
        }
        let decoded = serde_json::from_slice(&payload)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        Ok(Some(decoded))
    }
}

impl Encoder<DataportPayload> for DataportCodec {
    type Error = io::Error;

    fn encode(&mut self, item: DataportPayload, dst: &mut BytesMut) -> Result<(), io::Error> {
        let payload = serde_json::to_vec(&item)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        if payload.len() > self.max_payload {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "payload of {} bytes exceeds cap {}",
                    payload.len(),
                    self.max_payload
                ),
            ));
        }
        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u8(FLAG_ENC_JSON);
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

/// A framed dataport connection.
pub type DataportLink = Framed<TcpStream, DataportCodec>;
