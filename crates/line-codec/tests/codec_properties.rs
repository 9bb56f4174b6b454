//! Property tests for the line codec
//!
//! Every message category must survive encode/decode, and a frame split at
//! arbitrary points must decode exactly once, after its last byte arrives.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use proptest::prelude::*;
use rvoip_line_codec::{
    encode, CallAction, CallReference, Capabilities, DecodeOutcome, DtmfDigit, HangupCause,
    LineMessage, ResetKind, StreamDecoder,
};

fn capabilities() -> impl Strategy<Value = Capabilities> {
    (any::<bool>(), any::<bool>(), any::<bool>(), any::<bool>(), any::<bool>()).prop_map(
        |(audio, video, dtmf_out_of_band, hold, linear_audio)| Capabilities {
            audio,
            video,
            dtmf_out_of_band,
            hold,
            linear_audio,
        },
    )
}

fn action() -> impl Strategy<Value = CallAction> {
    prop_oneof![
        Just(CallAction::Offer),
        Just(CallAction::Ring),
        Just(CallAction::Answer),
        Just(CallAction::Hold),
        Just(CallAction::Resume),
        Just(CallAction::Hangup),
    ]
}

fn digit() -> impl Strategy<Value = DtmfDigit> {
    prop::sample::select("0123456789*#ABCD".chars().collect::<Vec<_>>())
        .prop_map(|c| DtmfDigit::new(c).unwrap())
}

fn address() -> impl Strategy<Value = IpAddr> {
    prop_oneof![
        any::<[u8; 4]>().prop_map(|o| IpAddr::V4(Ipv4Addr::from(o))),
        any::<[u8; 16]>().prop_map(|o| IpAddr::V6(Ipv6Addr::from(o))),
    ]
}

fn message() -> impl Strategy<Value = LineMessage> {
    let text = "[a-zA-Z0-9 ._-]{0,40}";
    let registration = prop_oneof![
        any::<u64>().prop_map(|timestamp| LineMessage::KeepAlive { timestamp }),
        any::<u64>().prop_map(|timestamp| LineMessage::KeepAliveAck { timestamp }),
        (any::<u32>(), text, capabilities()).prop_map(|(device_id, device_name, capabilities)| {
            LineMessage::Register { device_id, device_name, capabilities }
        }),
        any::<u32>().prop_map(|keepalive_secs| LineMessage::RegisterAck { keepalive_secs }),
        text.prop_map(|reason| LineMessage::RegisterReject { reason }),
        Just(LineMessage::Unregister),
        Just(LineMessage::UnregisterAck),
    ];
    let call = prop_oneof![
        (any::<u32>(), action(), any::<u32>(), text).prop_map(|(r, action, cause, party)| {
            LineMessage::CallControl {
                call_ref: CallReference(r),
                action,
                cause: HangupCause(cause),
                party,
            }
        }),
        (any::<u32>(), digit(), any::<u32>()).prop_map(|(r, digit, duration_ms)| {
            LineMessage::Dtmf { call_ref: CallReference(r), digit, duration_ms }
        }),
        (any::<u32>(), address(), any::<u16>(), text, any::<u32>(), any::<u32>()).prop_map(
            |(r, address, port, codec, sample_rate, frame_ms)| LineMessage::MediaNegotiation {
                call_ref: CallReference(r),
                address,
                port,
                codec,
                sample_rate,
                frame_ms,
            }
        ),
        prop_oneof![Just(ResetKind::Restart), Just(ResetKind::Shutdown)]
            .prop_map(|kind| LineMessage::Reset { kind }),
    ];
    prop_oneof![registration, call]
}

proptest! {
    #[test]
    fn decode_inverts_encode(msg in message()) {
        let frame = encode(&msg).unwrap();
        let mut decoder = StreamDecoder::new();
        match decoder.decode_chunk(&frame) {
            DecodeOutcome::Message(decoded) => prop_assert_eq!(decoded, msg),
            other => prop_assert!(false, "unexpected outcome {:?}", other),
        }
        prop_assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn split_frame_decodes_once_after_last_chunk(
        msg in message(),
        cuts in prop::collection::vec(any::<prop::sample::Index>(), 1..6),
    ) {
        let frame = encode(&msg).unwrap();
        let mut points: Vec<usize> = cuts.iter().map(|i| i.index(frame.len())).filter(|p| *p > 0).collect();
        points.sort_unstable();
        points.dedup();

        let mut chunks = Vec::new();
        let mut start = 0;
        for p in points {
            chunks.push(&frame[start..p]);
            start = p;
        }
        chunks.push(&frame[start..]);

        let mut decoder = StreamDecoder::new();
        let last = chunks.len() - 1;
        for (i, chunk) in chunks.into_iter().enumerate() {
            let outcome = decoder.decode_chunk(chunk);
            if i < last {
                prop_assert!(matches!(outcome, DecodeOutcome::Incomplete), "chunk {} gave {:?}", i, outcome);
            } else {
                match outcome {
                    DecodeOutcome::Message(decoded) => prop_assert_eq!(&decoded, &msg),
                    other => prop_assert!(false, "final chunk gave {:?}", other),
                }
            }
        }
        prop_assert!(matches!(decoder.next_buffered(), DecodeOutcome::Incomplete));
    }
}

#[test]
fn back_to_back_frames_in_one_read() {
    let first = LineMessage::KeepAlive { timestamp: 1 };
    let second = LineMessage::hangup(CallReference(4), HangupCause::NORMAL_CLEARING);

    let mut bytes = encode(&first).unwrap().to_vec();
    bytes.extend_from_slice(&encode(&second).unwrap());

    let mut decoder = StreamDecoder::new();
    assert!(matches!(decoder.decode_chunk(&bytes), DecodeOutcome::Message(ref m) if *m == first));
    assert!(matches!(decoder.next_buffered(), DecodeOutcome::Message(ref m) if *m == second));
    assert!(matches!(decoder.next_buffered(), DecodeOutcome::Incomplete));
}
