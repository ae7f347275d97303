//! Framed peer transport.
//!
//! Every peer frame is `flags(u8) | payload-length(u32 BE) | payload`. The
//! flags byte selects the payload encoding; only JSON is defined today.
//! Oversized frames are rejected before any payload is buffered.

use std::io;
use std::net::SocketAddr;

use bytes::{Buf, BufMut, BytesMut};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Decoder, Encoder, Framed};

use super::types::{PeerMsg, QuorumError};

const FLAG_ENC_JSON: u8 = 0x1;
const HEADER_LEN: usize = 5;

/// Codec for `PeerMsg` frames.
#[derive(Clone, Copy, Debug)]
pub struct PeerCodec {
    max_frame: usize,
}

impl PeerCodec {
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }
}

impl Decoder for PeerCodec {
    type Item = PeerMsg;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<PeerMsg>, io::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let flags = src[0];
        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if len > self.max_frame {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("peer frame of {len} bytes exceeds cap {}", self.max_frame),
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
                format!("unknown peer frame encoding {flags:#x}"),
            ));
        }
        let msg = serde_json::from_slice(&payload)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        Ok(Some(msg))
    }
}

impl Encoder<PeerMsg> for PeerCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: PeerMsg, dst: &mut BytesMut) -> Result<(), io::Error> {
        let payload = serde_json::to_vec(&msg)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        if payload.len() > self.max_frame {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "peer frame of {} bytes exceeds cap {}",
                    payload.len(),
                    self.max_frame
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

/// A framed peer connection.
pub type PeerLink = Framed<TcpStream, PeerCodec>;

/// TCP listener accepting follower links.
///
/// Started before election so a follower that finishes its election first can
/// already connect; the leader picks the connection up once it starts leading.
pub struct PeerListener {
    inner: TcpListener,
    max_frame: usize,
}

impl PeerListener {
    pub async fn bind(addr: &str, max_frame: usize) -> Result<Self, QuorumError> {
        let inner = TcpListener::bind(addr)
            .await
            .map_err(|err| QuorumError::ListenerFail(err.to_string()))?;
        Ok(Self { inner, max_frame })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub async fn accept(&self) -> io::Result<(PeerLink, SocketAddr)> {
        let (stream, raddr) = self.inner.accept().await?;
        Ok((Framed::new(stream, PeerCodec::new(self.max_frame)), raddr))
    }
}

/// Dial a peer and frame the stream.
pub async fn connect_peer(addr: &str, max_frame: usize) -> Result<PeerLink, QuorumError> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(Framed::new(stream, PeerCodec::new(max_frame)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quorum::types::Txnid;

    #[test]
    fn frame_roundtrip() {
        let mut codec = PeerCodec::new(1 << 16);
        let mut buf = BytesMut::new();
        let msg = PeerMsg::Commit {
            txnid: Txnid::new(1, 42),
        };
        codec.encode(msg, &mut buf).unwrap();
        // A partial header decodes to nothing and consumes nothing.
        let mut partial = BytesMut::from(&buf[..3]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), 3);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        match decoded {
            PeerMsg::Commit { txnid } => assert_eq!(txnid, Txnid::new(1, 42)),
            other => panic!("unexpected frame {other:?}"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut codec = PeerCodec::new(8);
        let mut buf = BytesMut::new();
        let err = codec
            .encode(
                PeerMsg::Request {
                    req_id: 1,
                    op: 0,
                    key: "a-key-larger-than-the-cap".into(),
                    content: vec![0; 64],
                    fid: "f".into(),
                },
                &mut buf,
            )
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        // Decoding an oversized header fails without waiting for the payload.
        let mut raw = BytesMut::new();
        raw.put_u8(0x1);
        raw.put_u32(1 << 30);
        let err = codec.decode(&mut raw).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
