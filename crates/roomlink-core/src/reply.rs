//! ---
//! rl_section: "05-protocol-core"
//! rl_subsection: "module"
//! rl_type: "source"
//! rl_scope: "code"
//! rl_description: "Master orchestration of the room controller bus."
//! rl_version: "v0.0.0-prealpha"
//! rl_owner: "tbd"
//! ---
//! Reply stream grammar: `NAK`, `ACK`, or `ACK` followed by one frame.

use roomlink_msg::{decode, expected_len, AddressPair, Frame, ReplyShape, ACK, NAK};

/// Classification of the bytes received so far for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyStatus {
    /// Nothing conclusive yet.
    Incomplete,
    /// Negative acknowledgement.
    Nak,
    /// Positive acknowledgement with no data.
    Ack,
    /// Positive acknowledgement and a valid frame from the expected unit.
    AckWithFrame(Frame),
    /// Garbage, wrong addresses or a bad checksum; same handling as silence.
    Invalid,
}

/// Classify `bytes` against the reply grammar `shape` expects.
pub fn classify_reply(bytes: &[u8], shape: ReplyShape, expect: AddressPair) -> ReplyStatus {
    let Some(&first) = bytes.first() else {
        return ReplyStatus::Incomplete;
    };
    match (first, shape) {
        (NAK, _) => ReplyStatus::Nak,
        (ACK, ReplyShape::AckThenFrame) => {
            let rest = &bytes[1..];
            match expected_len(rest) {
                Ok(Some(needed)) if rest.len() >= needed => {
                    match decode(&rest[..needed], Some(expect)) {
                        Ok(frame) => ReplyStatus::AckWithFrame(frame),
                        Err(_) => ReplyStatus::Invalid,
                    }
                }
                Ok(_) => ReplyStatus::Incomplete,
                Err(_) => ReplyStatus::Invalid,
            }
        }
        (ACK, _) => ReplyStatus::Ack,
        _ => ReplyStatus::Invalid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomlink_msg::{encode, FrameKind};

    const PAIR: AddressPair = AddressPair::reply(0x0001, 0x0102);

    fn ack_frame(src: u16, payload: Vec<u8>) -> Vec<u8> {
        let mut bytes = vec![ACK];
        bytes.extend(encode(FrameKind::Command, 0x0001, src, payload).unwrap().to_bytes());
        bytes
    }

    #[test]
    fn simple_acknowledgements() {
        assert_eq!(classify_reply(&[], ReplyShape::AckOnly, PAIR), ReplyStatus::Incomplete);
        assert_eq!(classify_reply(&[NAK], ReplyShape::AckThenFrame, PAIR), ReplyStatus::Nak);
        assert_eq!(classify_reply(&[ACK], ReplyShape::AckOnly, PAIR), ReplyStatus::Ack);
        assert_eq!(classify_reply(&[0x33], ReplyShape::AckOnly, PAIR), ReplyStatus::Invalid);
    }

    #[test]
    fn frame_accumulates_then_validates() {
        let bytes = ack_frame(0x0102, vec![0x01, 0x07, 0x00, 0xDC]);
        for cut in 1..bytes.len() {
            assert_eq!(
                classify_reply(&bytes[..cut], ReplyShape::AckThenFrame, PAIR),
                ReplyStatus::Incomplete,
                "cut at {cut}"
            );
        }
        match classify_reply(&bytes, ReplyShape::AckThenFrame, PAIR) {
            ReplyStatus::AckWithFrame(frame) => assert_eq!(frame.payload, vec![0x01, 0x07, 0x00, 0xDC]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn foreign_or_corrupt_frames_are_invalid() {
        let foreign = ack_frame(0x0103, vec![1]);
        assert_eq!(classify_reply(&foreign, ReplyShape::AckThenFrame, PAIR), ReplyStatus::Invalid);

        let mut corrupt = ack_frame(0x0102, vec![1, 2]);
        let checksum_at = corrupt.len() - 2;
        corrupt[checksum_at] ^= 0x5A;
        assert_eq!(classify_reply(&corrupt, ReplyShape::AckThenFrame, PAIR), ReplyStatus::Invalid);

        assert_eq!(
            classify_reply(&[ACK, 0x7F], ReplyShape::AckThenFrame, PAIR),
            ReplyStatus::Invalid
        );
    }
}
