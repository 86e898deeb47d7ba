//! CBOR framing for [`ControlMsg`] on a QUIC control stream.
//!
//! Each frame is a 4-byte big-endian length followed by the CBOR body.

use quinn::{RecvStream, SendStream};

use crate::domain::control::ControlMsg;

/// Frames above this size are rejected before allocation.
pub const MAX_FRAME_LEN: usize = 256 * 1024;

/// Encodes / decodes [`ControlMsg`] using CBOR (via `serde_cbor`).
#[derive(Debug, Clone, Copy, Default)]
pub struct CborControlCodec;

impl CborControlCodec {
    pub fn encode(&self, msg: &ControlMsg) -> anyhow::Result<Vec<u8>> {
        serde_cbor::to_vec(msg).map_err(Into::into)
    }

    pub fn decode(&self, data: &[u8]) -> anyhow::Result<ControlMsg> {
        serde_cbor::from_slice(data).map_err(Into::into)
    }

    /// Length-prefixed frame for `msg`.
    pub fn frame(&self, msg: &ControlMsg) -> anyhow::Result<Vec<u8>> {
        let payload = self.encode(msg)?;
        anyhow::ensure!(payload.len() <= MAX_FRAME_LEN, "frame too large");
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    pub async fn write_msg(&self, send: &mut SendStream, msg: &ControlMsg) -> anyhow::Result<()> {
        let frame = self.frame(msg)?;
        send.write_all(&frame).await?;
        Ok(())
    }

    pub async fn read_msg(&self, recv: &mut RecvStream) -> anyhow::Result<ControlMsg> {
        let mut len_buf = [0u8; 4];
        recv.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        anyhow::ensure!(len <= MAX_FRAME_LEN, "frame of {len} bytes exceeds limit");

        let mut payload = vec![0u8; len];
        recv.read_exact(&mut payload).await?;
        self.decode(&payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::identity::PeerId;

    #[test]
    fn frame_carries_length_prefix() {
        let codec = CborControlCodec;
        let msg = ControlMsg::Signal {
            peer_id: PeerId(7),
            payload: vec![0xAB; 32],
            is_polite: true,
        };
        let frame = codec.frame(&msg).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);
        assert_eq!(codec.decode(&frame[4..]).unwrap(), msg);
    }

    #[test]
    fn rejects_garbage() {
        assert!(CborControlCodec.decode(&[0xFF, 0x00, 0x13]).is_err());
    }
}
