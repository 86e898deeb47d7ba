//! CBOR-based [`SignalCodec`] implementation.

use bytes::Bytes;

use crate::application::ports::SignalCodec;
use crate::domain::signal::SignalMessage;

/// Encodes / decodes [`SignalMessage`] using CBOR (via `serde_cbor`).
#[derive(Debug, Clone, Copy, Default)]
pub struct CborSignalCodec;

impl SignalCodec for CborSignalCodec {
    fn encode(&self, msg: &SignalMessage) -> anyhow::Result<Bytes> {
        Ok(Bytes::from(serde_cbor::to_vec(msg)?))
    }

    fn decode(&self, data: &[u8]) -> anyhow::Result<SignalMessage> {
        serde_cbor::from_slice(data).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::peer::{IceCandidate, SdpType, SessionDescription};

    #[test]
    fn description_survives_the_wire() {
        let msg = SignalMessage::Description(SessionDescription::new(
            SdpType::ProvisionalAnswer,
            "v=0\r\n",
        ));
        let bytes = CborSignalCodec.encode(&msg).unwrap();
        assert_eq!(CborSignalCodec.decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn candidate_without_mid() {
        let msg = SignalMessage::Candidate(IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".into(),
            sdp_mline_index: 1,
            sdp_mid: None,
        });
        let bytes = CborSignalCodec.encode(&msg).unwrap();
        assert!(matches!(
            CborSignalCodec.decode(&bytes).unwrap(),
            SignalMessage::Candidate(IceCandidate { sdp_mid: None, .. })
        ));
    }
}
