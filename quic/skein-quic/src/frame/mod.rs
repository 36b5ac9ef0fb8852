// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Frame codecs.
//!
//! Frames decode from decrypted packet payloads into a closed [`Frame`]
//! enum. Emission mostly happens field-by-field through the packet builder
//! (which writes the frame type itself); [`Frame::encode`] provides the
//! standalone encoder used by simple write paths and the round-trip tests.

use crate::{
    cid::{ConnectionId, StatelessResetToken, STATELESS_RESET_TOKEN_LEN},
    transport::error::TransportError,
};
use bytes::Bytes;
use core::ops::RangeInclusive;
use skein_codec::Buffer;

//= https://www.rfc-editor.org/rfc/rfc9000#section-19
pub mod type_id {
    pub const PADDING: u64 = 0x00;
    pub const PING: u64 = 0x01;
    pub const ACK: u64 = 0x02;
    pub const ACK_ECN: u64 = 0x03;
    pub const RESET_STREAM: u64 = 0x04;
    pub const STOP_SENDING: u64 = 0x05;
    pub const CRYPTO: u64 = 0x06;
    pub const NEW_TOKEN: u64 = 0x07;
    pub const STREAM_BASE: u64 = 0x08;
    pub const STREAM_MAX: u64 = 0x0f;
    pub const MAX_DATA: u64 = 0x10;
    pub const MAX_STREAM_DATA: u64 = 0x11;
    pub const MAX_STREAMS_BIDI: u64 = 0x12;
    pub const MAX_STREAMS_UNI: u64 = 0x13;
    pub const DATA_BLOCKED: u64 = 0x14;
    pub const STREAM_DATA_BLOCKED: u64 = 0x15;
    pub const STREAMS_BLOCKED_BIDI: u64 = 0x16;
    pub const STREAMS_BLOCKED_UNI: u64 = 0x17;
    pub const NEW_CONNECTION_ID: u64 = 0x18;
    pub const RETIRE_CONNECTION_ID: u64 = 0x19;
    pub const PATH_CHALLENGE: u64 = 0x1a;
    pub const PATH_RESPONSE: u64 = 0x1b;
    pub const TRANSPORT_CLOSE: u64 = 0x1c;
    pub const APPLICATION_CLOSE: u64 = 0x1d;
    pub const HANDSHAKE_DONE: u64 = 0x1e;
    // RFC 9221
    pub const DATAGRAM: u64 = 0x30;
    pub const DATAGRAM_WITH_LENGTH: u64 = 0x31;
}

const STREAM_OFF_BIT: u64 = 0x04;
const STREAM_LEN_BIT: u64 = 0x02;
const STREAM_FIN_BIT: u64 = 0x01;

pub const PATH_CHALLENGE_SIZE: usize = 8;

//= https://www.rfc-editor.org/rfc/rfc9002#section-2
//# Packets that contain ack-eliciting frames elicit an ACK from the
//# receiver within the maximum acknowledgment delay and are called
//# ack-eliciting packets.
/// Whether a frame of this type elicits an acknowledgment.
pub fn is_ack_eliciting(frame_type: u64) -> bool {
    !matches!(
        frame_type,
        type_id::PADDING
            | type_id::ACK
            | type_id::ACK_ECN
            | type_id::TRANSPORT_CLOSE
            | type_id::APPLICATION_CLOSE
    )
}

//= https://www.rfc-editor.org/rfc/rfc9002#section-2
//# Packets are considered in flight when they are ack-eliciting or
//# contain a PADDING frame, and they have been sent but are not
//# acknowledged, declared lost, or discarded along with old keys.
pub fn is_in_flight(frame_type: u64) -> bool {
    !matches!(
        frame_type,
        type_id::ACK | type_id::ACK_ECN | type_id::TRANSPORT_CLOSE | type_id::APPLICATION_CLOSE
    )
}

pub fn is_stream_type(frame_type: u64) -> bool {
    (type_id::STREAM_BASE..=type_id::STREAM_MAX).contains(&frame_type)
}

/// A decoded QUIC frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Padding {
        length: usize,
    },
    Ping,
    Ack {
        largest_acknowledged: u64,
        /// Raw value, still scaled by the sender's ack_delay_exponent.
        ack_delay: u64,
        /// Acknowledged packet-number ranges, ascending.
        ranges: Vec<RangeInclusive<u64>>,
        ecn_counts: Option<(u64, u64, u64)>,
    },
    ResetStream {
        stream_id: u64,
        error_code: u64,
        final_size: u64,
    },
    StopSending {
        stream_id: u64,
        error_code: u64,
    },
    Crypto {
        offset: u64,
        data: Bytes,
    },
    NewToken {
        token: Bytes,
    },
    Stream {
        stream_id: u64,
        offset: u64,
        data: Bytes,
        fin: bool,
    },
    MaxData {
        maximum: u64,
    },
    MaxStreamData {
        stream_id: u64,
        maximum: u64,
    },
    MaxStreams {
        bidirectional: bool,
        maximum: u64,
    },
    DataBlocked {
        limit: u64,
    },
    StreamDataBlocked {
        stream_id: u64,
        limit: u64,
    },
    StreamsBlocked {
        bidirectional: bool,
        limit: u64,
    },
    NewConnectionId {
        sequence: u64,
        retire_prior_to: u64,
        connection_id: ConnectionId,
        stateless_reset_token: StatelessResetToken,
    },
    RetireConnectionId {
        sequence: u64,
    },
    PathChallenge {
        data: [u8; PATH_CHALLENGE_SIZE],
    },
    PathResponse {
        data: [u8; PATH_CHALLENGE_SIZE],
    },
    ConnectionClose {
        error_code: u64,
        /// `Some` for the transport variant (0x1c), `None` for the
        /// application variant (0x1d).
        frame_type: Option<u64>,
        reason: Bytes,
    },
    HandshakeDone,
    Datagram {
        data: Bytes,
    },
}

impl Frame {
    /// The wire type this frame encodes to. Stream frames report the base
    /// type with the OFF and LEN bits that [`Frame::encode`] uses.
    pub fn type_id(&self) -> u64 {
        match self {
            Frame::Padding { .. } => type_id::PADDING,
            Frame::Ping => type_id::PING,
            Frame::Ack { ecn_counts, .. } => {
                if ecn_counts.is_some() {
                    type_id::ACK_ECN
                } else {
                    type_id::ACK
                }
            }
            Frame::ResetStream { .. } => type_id::RESET_STREAM,
            Frame::StopSending { .. } => type_id::STOP_SENDING,
            Frame::Crypto { .. } => type_id::CRYPTO,
            Frame::NewToken { .. } => type_id::NEW_TOKEN,
            Frame::Stream { fin, .. } => {
                let mut tag = type_id::STREAM_BASE | STREAM_OFF_BIT | STREAM_LEN_BIT;
                if *fin {
                    tag |= STREAM_FIN_BIT;
                }
                tag
            }
            Frame::MaxData { .. } => type_id::MAX_DATA,
            Frame::MaxStreamData { .. } => type_id::MAX_STREAM_DATA,
            Frame::MaxStreams { bidirectional: true, .. } => type_id::MAX_STREAMS_BIDI,
            Frame::MaxStreams { bidirectional: false, .. } => type_id::MAX_STREAMS_UNI,
            Frame::DataBlocked { .. } => type_id::DATA_BLOCKED,
            Frame::StreamDataBlocked { .. } => type_id::STREAM_DATA_BLOCKED,
            Frame::StreamsBlocked { bidirectional: true, .. } => type_id::STREAMS_BLOCKED_BIDI,
            Frame::StreamsBlocked { bidirectional: false, .. } => type_id::STREAMS_BLOCKED_UNI,
            Frame::NewConnectionId { .. } => type_id::NEW_CONNECTION_ID,
            Frame::RetireConnectionId { .. } => type_id::RETIRE_CONNECTION_ID,
            Frame::PathChallenge { .. } => type_id::PATH_CHALLENGE,
            Frame::PathResponse { .. } => type_id::PATH_RESPONSE,
            Frame::ConnectionClose { frame_type: Some(_), .. } => type_id::TRANSPORT_CLOSE,
            Frame::ConnectionClose { frame_type: None, .. } => type_id::APPLICATION_CLOSE,
            Frame::HandshakeDone => type_id::HANDSHAKE_DONE,
            Frame::Datagram { .. } => type_id::DATAGRAM_WITH_LENGTH,
        }
    }

    /// Decodes the next frame. The cursor must sit on a frame type byte.
    pub fn decode(buf: &mut Buffer) -> Result<Frame, TransportError> {
        let frame_type = buf.get_var()?;
        let error = |reason| TransportError::FRAME_ENCODING_ERROR
            .with_frame_type(frame_type)
            .with_reason(reason);

        let frame = match frame_type {
            type_id::PADDING => {
                // coalesce the run of zero bytes that follows
                let mut length = 1;
                while buf.remaining() > 0 {
                    let pos = buf.tell();
                    if buf.get_u8()? != 0 {
                        buf.seek(pos)?;
                        break;
                    }
                    length += 1;
                }
                Frame::Padding { length }
            }
            type_id::PING => Frame::Ping,
            type_id::ACK | type_id::ACK_ECN => {
                let largest_acknowledged = buf.get_var()?;
                let ack_delay = buf.get_var()?;
                let range_count = buf.get_var()?;
                let first_range = buf.get_var()?;

                let mut smallest = largest_acknowledged
                    .checked_sub(first_range)
                    .ok_or_else(|| error("ACK range underflow"))?;
                let mut ranges = vec![smallest..=largest_acknowledged];

                for _ in 0..range_count {
                    //= https://www.rfc-editor.org/rfc/rfc9000#section-19.3.1
                    //# Each Gap indicates a range of packets that are not being
                    //# acknowledged.  The number of packets in the gap is one
                    //# higher than the encoded value of the Gap field.
                    let gap = buf.get_var()?;
                    let length = buf.get_var()?;
                    let end = smallest
                        .checked_sub(gap + 2)
                        .ok_or_else(|| error("ACK gap underflow"))?;
                    smallest = end
                        .checked_sub(length)
                        .ok_or_else(|| error("ACK range underflow"))?;
                    ranges.push(smallest..=end);
                }
                ranges.reverse();

                let ecn_counts = if frame_type == type_id::ACK_ECN {
                    Some((buf.get_var()?, buf.get_var()?, buf.get_var()?))
                } else {
                    None
                };

                Frame::Ack {
                    largest_acknowledged,
                    ack_delay,
                    ranges,
                    ecn_counts,
                }
            }
            type_id::RESET_STREAM => Frame::ResetStream {
                stream_id: buf.get_var()?,
                error_code: buf.get_var()?,
                final_size: buf.get_var()?,
            },
            type_id::STOP_SENDING => Frame::StopSending {
                stream_id: buf.get_var()?,
                error_code: buf.get_var()?,
            },
            type_id::CRYPTO => {
                let offset = buf.get_var()?;
                let data = Bytes::copy_from_slice(buf.get_var_bytes()?);
                Frame::Crypto { offset, data }
            }
            type_id::NEW_TOKEN => {
                let token = Bytes::copy_from_slice(buf.get_var_bytes()?);
                //= https://www.rfc-editor.org/rfc/rfc9000#section-19.7
                //# A client MUST treat receipt of a NEW_TOKEN frame with an
                //# empty Token field as a connection error of type
                //# FRAME_ENCODING_ERROR.
                if token.is_empty() {
                    return Err(error("empty NEW_TOKEN token"));
                }
                Frame::NewToken { token }
            }
            _ if is_stream_type(frame_type) => {
                let stream_id = buf.get_var()?;
                let offset = if frame_type & STREAM_OFF_BIT != 0 {
                    buf.get_var()?
                } else {
                    0
                };
                let data = if frame_type & STREAM_LEN_BIT != 0 {
                    Bytes::copy_from_slice(buf.get_var_bytes()?)
                } else {
                    let rest = buf.remaining();
                    Bytes::copy_from_slice(buf.get_bytes(rest)?)
                };
                let fin = frame_type & STREAM_FIN_BIT != 0;
                //= https://www.rfc-editor.org/rfc/rfc9000#section-19.8
                //# The largest offset delivered on a stream -- the sum of the
                //# offset and data length -- cannot exceed 2^62-1.
                if offset
                    .checked_add(data.len() as u64)
                    .map_or(true, |end| end >= 1 << 62)
                {
                    return Err(TransportError::FLOW_CONTROL_ERROR
                        .with_frame_type(frame_type)
                        .with_reason("stream offset overflow"));
                }
                Frame::Stream {
                    stream_id,
                    offset,
                    data,
                    fin,
                }
            }
            type_id::MAX_DATA => Frame::MaxData {
                maximum: buf.get_var()?,
            },
            type_id::MAX_STREAM_DATA => Frame::MaxStreamData {
                stream_id: buf.get_var()?,
                maximum: buf.get_var()?,
            },
            type_id::MAX_STREAMS_BIDI | type_id::MAX_STREAMS_UNI => {
                let maximum = buf.get_var()?;
                //= https://www.rfc-editor.org/rfc/rfc9000#section-19.11
                //# This value cannot exceed 2^60, as it is not possible to
                //# encode stream IDs larger than 2^62-1.
                if maximum > 1 << 60 {
                    return Err(error("MAX_STREAMS above 2^60"));
                }
                Frame::MaxStreams {
                    bidirectional: frame_type == type_id::MAX_STREAMS_BIDI,
                    maximum,
                }
            }
            type_id::DATA_BLOCKED => Frame::DataBlocked {
                limit: buf.get_var()?,
            },
            type_id::STREAM_DATA_BLOCKED => Frame::StreamDataBlocked {
                stream_id: buf.get_var()?,
                limit: buf.get_var()?,
            },
            type_id::STREAMS_BLOCKED_BIDI | type_id::STREAMS_BLOCKED_UNI => Frame::StreamsBlocked {
                bidirectional: frame_type == type_id::STREAMS_BLOCKED_BIDI,
                limit: buf.get_var()?,
            },
            type_id::NEW_CONNECTION_ID => {
                let sequence = buf.get_var()?;
                let retire_prior_to = buf.get_var()?;
                //= https://www.rfc-editor.org/rfc/rfc9000#section-19.15
                //# Receipt of a frame with a Retire Prior To field greater than
                //# the Sequence Number field MUST be treated as a connection
                //# error of type FRAME_ENCODING_ERROR.
                if retire_prior_to > sequence {
                    return Err(error("retire_prior_to exceeds sequence"));
                }
                let cid_len = buf.get_u8()? as usize;
                //= https://www.rfc-editor.org/rfc/rfc9000#section-19.15
                //# Values less than 1 and greater than 20 are invalid and MUST
                //# be treated as a connection error of type
                //# FRAME_ENCODING_ERROR.
                if !(1..=20).contains(&cid_len) {
                    return Err(error("invalid connection id length"));
                }
                let connection_id = ConnectionId::try_from_slice(buf.get_bytes(cid_len)?)
                    .map_err(|_| error("invalid connection id length"))?;
                let token_bytes = buf.get_bytes(STATELESS_RESET_TOKEN_LEN)?;
                let mut stateless_reset_token = [0; STATELESS_RESET_TOKEN_LEN];
                stateless_reset_token.copy_from_slice(token_bytes);
                Frame::NewConnectionId {
                    sequence,
                    retire_prior_to,
                    connection_id,
                    stateless_reset_token,
                }
            }
            type_id::RETIRE_CONNECTION_ID => Frame::RetireConnectionId {
                sequence: buf.get_var()?,
            },
            type_id::PATH_CHALLENGE => {
                let mut data = [0; PATH_CHALLENGE_SIZE];
                data.copy_from_slice(buf.get_bytes(PATH_CHALLENGE_SIZE)?);
                Frame::PathChallenge { data }
            }
            type_id::PATH_RESPONSE => {
                let mut data = [0; PATH_CHALLENGE_SIZE];
                data.copy_from_slice(buf.get_bytes(PATH_CHALLENGE_SIZE)?);
                Frame::PathResponse { data }
            }
            type_id::TRANSPORT_CLOSE => {
                let error_code = buf.get_var()?;
                let offending_type = buf.get_var()?;
                let reason = Bytes::copy_from_slice(buf.get_var_bytes()?);
                Frame::ConnectionClose {
                    error_code,
                    frame_type: Some(offending_type),
                    reason,
                }
            }
            type_id::APPLICATION_CLOSE => {
                let error_code = buf.get_var()?;
                let reason = Bytes::copy_from_slice(buf.get_var_bytes()?);
                Frame::ConnectionClose {
                    error_code,
                    frame_type: None,
                    reason,
                }
            }
            type_id::HANDSHAKE_DONE => Frame::HandshakeDone,
            type_id::DATAGRAM | type_id::DATAGRAM_WITH_LENGTH => {
                let data = if frame_type == type_id::DATAGRAM_WITH_LENGTH {
                    Bytes::copy_from_slice(buf.get_var_bytes()?)
                } else {
                    let rest = buf.remaining();
                    Bytes::copy_from_slice(buf.get_bytes(rest)?)
                };
                Frame::Datagram { data }
            }
            _ => {
                //= https://www.rfc-editor.org/rfc/rfc9000#section-12.4
                //# An endpoint MUST treat the receipt of a frame of unknown
                //# type as a connection error of type FRAME_ENCODING_ERROR.
                return Err(error("unknown frame type"));
            }
        };

        Ok(frame)
    }

    /// Encodes the frame, including its type.
    pub fn encode(&self, buf: &mut Buffer) -> skein_codec::Result<()> {
        buf.put_var(self.type_id())?;
        match self {
            Frame::Padding { length } => buf.put_zeroes(length - 1)?,
            Frame::Ping | Frame::HandshakeDone => {}
            Frame::Ack {
                largest_acknowledged,
                ack_delay,
                ranges,
                ecn_counts,
            } => {
                encode_ack_body(buf, *largest_acknowledged, *ack_delay, ranges)?;
                if let Some((ect0, ect1, ce)) = ecn_counts {
                    buf.put_var(*ect0)?;
                    buf.put_var(*ect1)?;
                    buf.put_var(*ce)?;
                }
            }
            Frame::ResetStream {
                stream_id,
                error_code,
                final_size,
            } => {
                buf.put_var(*stream_id)?;
                buf.put_var(*error_code)?;
                buf.put_var(*final_size)?;
            }
            Frame::StopSending {
                stream_id,
                error_code,
            } => {
                buf.put_var(*stream_id)?;
                buf.put_var(*error_code)?;
            }
            Frame::Crypto { offset, data } => {
                buf.put_var(*offset)?;
                buf.put_var_bytes(data)?;
            }
            Frame::NewToken { token } => buf.put_var_bytes(token)?,
            Frame::Stream {
                stream_id,
                offset,
                data,
                ..
            } => {
                buf.put_var(*stream_id)?;
                buf.put_var(*offset)?;
                buf.put_var_bytes(data)?;
            }
            Frame::MaxData { maximum } => buf.put_var(*maximum)?,
            Frame::MaxStreamData { stream_id, maximum } => {
                buf.put_var(*stream_id)?;
                buf.put_var(*maximum)?;
            }
            Frame::MaxStreams { maximum, .. } => buf.put_var(*maximum)?,
            Frame::DataBlocked { limit } => buf.put_var(*limit)?,
            Frame::StreamDataBlocked { stream_id, limit } => {
                buf.put_var(*stream_id)?;
                buf.put_var(*limit)?;
            }
            Frame::StreamsBlocked { limit, .. } => buf.put_var(*limit)?,
            Frame::NewConnectionId {
                sequence,
                retire_prior_to,
                connection_id,
                stateless_reset_token,
            } => {
                buf.put_var(*sequence)?;
                buf.put_var(*retire_prior_to)?;
                buf.put_u8(connection_id.len() as u8)?;
                buf.put_bytes(connection_id.as_ref())?;
                buf.put_bytes(stateless_reset_token)?;
            }
            Frame::RetireConnectionId { sequence } => buf.put_var(*sequence)?,
            Frame::PathChallenge { data } | Frame::PathResponse { data } => {
                buf.put_bytes(data)?
            }
            Frame::ConnectionClose {
                error_code,
                frame_type,
                reason,
            } => {
                buf.put_var(*error_code)?;
                if let Some(offending_type) = frame_type {
                    buf.put_var(*offending_type)?;
                }
                buf.put_var_bytes(reason)?;
            }
            Frame::Datagram { data } => buf.put_var_bytes(data)?,
        }
        Ok(())
    }
}

/// Writes the body of an ACK frame (everything after the type).
///
/// `ranges` must be disjoint and ascending; the most recent range is encoded
/// first per the wire format.
pub fn encode_ack_body(
    buf: &mut Buffer,
    largest_acknowledged: u64,
    ack_delay: u64,
    ranges: &[RangeInclusive<u64>],
) -> skein_codec::Result<()> {
    debug_assert!(!ranges.is_empty());
    let mut iter = ranges.iter().rev();
    let first = iter.next().expect("at least one ACK range");
    debug_assert_eq!(*first.end(), largest_acknowledged);

    buf.put_var(largest_acknowledged)?;
    buf.put_var(ack_delay)?;
    buf.put_var(ranges.len() as u64 - 1)?;
    buf.put_var(first.end() - first.start())?;

    let mut smallest = *first.start();
    for range in iter {
        let gap = smallest - range.end() - 2;
        buf.put_var(gap)?;
        buf.put_var(range.end() - range.start())?;
        smallest = *range.start();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: Frame) {
        let mut buf = Buffer::new(2048);
        frame.encode(&mut buf).unwrap();
        let encoded = buf.data().to_vec();
        let mut parse = Buffer::from_slice(&encoded);
        let decoded = Frame::decode(&mut parse).unwrap();
        assert!(parse.is_at_end(), "trailing bytes after {frame:?}");
        assert_eq!(decoded, frame);
    }

    #[test]
    fn every_frame_type_round_trips() {
        let cid = ConnectionId::try_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        for frame in [
            Frame::Padding { length: 7 },
            Frame::Ping,
            Frame::Ack {
                largest_acknowledged: 100,
                ack_delay: 13,
                ranges: vec![0..=3, 9..=20, 30..=100],
                ecn_counts: None,
            },
            Frame::Ack {
                largest_acknowledged: 5,
                ack_delay: 0,
                ranges: vec![5..=5],
                ecn_counts: Some((1, 2, 3)),
            },
            Frame::ResetStream {
                stream_id: 4,
                error_code: 9,
                final_size: 4242,
            },
            Frame::StopSending {
                stream_id: 8,
                error_code: 77,
            },
            Frame::Crypto {
                offset: 1200,
                data: Bytes::from_static(b"client hello"),
            },
            Frame::NewToken {
                token: Bytes::from_static(b"token"),
            },
            Frame::Stream {
                stream_id: 0,
                offset: 65_536,
                data: Bytes::from_static(b"payload"),
                fin: true,
            },
            Frame::MaxData { maximum: 1 << 20 },
            Frame::MaxStreamData {
                stream_id: 0,
                maximum: 1 << 19,
            },
            Frame::MaxStreams {
                bidirectional: true,
                maximum: 256,
            },
            Frame::MaxStreams {
                bidirectional: false,
                maximum: 3,
            },
            Frame::DataBlocked { limit: 1 << 20 },
            Frame::StreamDataBlocked {
                stream_id: 12,
                limit: 4096,
            },
            Frame::StreamsBlocked {
                bidirectional: false,
                limit: 128,
            },
            Frame::NewConnectionId {
                sequence: 3,
                retire_prior_to: 1,
                connection_id: cid,
                stateless_reset_token: [0xee; 16],
            },
            Frame::RetireConnectionId { sequence: 2 },
            Frame::PathChallenge { data: [9; 8] },
            Frame::PathResponse { data: [9; 8] },
            Frame::ConnectionClose {
                error_code: 0xA,
                frame_type: Some(0x06),
                reason: Bytes::from_static(b"ouch"),
            },
            Frame::ConnectionClose {
                error_code: 42,
                frame_type: None,
                reason: Bytes::new(),
            },
            Frame::HandshakeDone,
            Frame::Datagram {
                data: Bytes::from_static(b"quack"),
            },
        ] {
            round_trip(frame);
        }
    }

    #[test]
    fn padding_run_is_coalesced() {
        let mut parse = Buffer::from_slice(&[0, 0, 0, 0, 0x01]);
        assert_eq!(Frame::decode(&mut parse).unwrap(), Frame::Padding { length: 4 });
        assert_eq!(Frame::decode(&mut parse).unwrap(), Frame::Ping);
        assert!(parse.is_at_end());
    }

    #[test]
    fn stream_without_length_extends_to_packet_end() {
        // OFF=0, LEN=0, FIN=0
        let mut bytes = vec![0x08u8, 0x04];
        bytes.extend_from_slice(b"rest of packet");
        let mut parse = Buffer::from_slice(&bytes);
        match Frame::decode(&mut parse).unwrap() {
            Frame::Stream {
                stream_id,
                offset,
                data,
                fin,
            } => {
                assert_eq!(stream_id, 4);
                assert_eq!(offset, 0);
                assert_eq!(&data[..], b"rest of packet");
                assert!(!fin);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn ack_gap_encoding_matches_rfc() {
        // ranges 0..=3 and 9..=20: gap between 9 and 3 encodes as 9-3-2 = 4
        let mut buf = Buffer::new(64);
        encode_ack_body(&mut buf, 20, 0, &[0..=3, 9..=20]).unwrap();
        assert_eq!(buf.data(), &[20, 0, 1, 11, 4, 3]);
    }

    #[test]
    fn malformed_ack_is_rejected() {
        // first range larger than the largest acknowledged
        let mut parse = Buffer::from_slice(&[0x02, 5, 0, 0, 6]);
        let error = Frame::decode(&mut parse).unwrap_err();
        assert_eq!(error.code, TransportError::FRAME_ENCODING_ERROR.code);
        assert_eq!(error.frame_type, Some(type_id::ACK));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut parse = Buffer::from_slice(&[0x21]);
        let error = Frame::decode(&mut parse).unwrap_err();
        assert_eq!(error.code, TransportError::FRAME_ENCODING_ERROR.code);
    }

    #[test]
    fn classification_tables() {
        for frame_type in [type_id::ACK, type_id::TRANSPORT_CLOSE, type_id::APPLICATION_CLOSE] {
            assert!(!is_ack_eliciting(frame_type));
            assert!(!is_in_flight(frame_type));
        }
        // PADDING counts toward bytes in flight but does not elicit an ACK
        assert!(!is_ack_eliciting(type_id::PADDING));
        assert!(is_in_flight(type_id::PADDING));
        for frame_type in [type_id::PING, type_id::STREAM_BASE, type_id::CRYPTO, type_id::DATAGRAM]
        {
            assert!(is_ack_eliciting(frame_type));
            assert!(is_in_flight(frame_type));
        }
    }
}
