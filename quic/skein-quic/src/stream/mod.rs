// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Stream state machines, flow control and reassembly.
//!
//! Send states run Ready → Send → DataSent → DataRecvd on the clean path
//! and ResetSent → ResetRecvd after a reset. Receive states run
//! Recv → SizeKnown → DataRecvd → DataRead, or ResetRecvd → ResetRead.
//! Frame scheduling and credit accounting live here; the connection owns
//! stream creation, admission and the connection-level limits.

use crate::{ranges::RangeSet, transport::error::TransportError};
use bytes::Bytes;
use core::fmt;
use std::collections::BTreeMap;

//= https://www.rfc-editor.org/rfc/rfc9000#section-2.1
//# The least significant bit (0x01) of the stream ID identifies the
//# initiator of the stream.
#[inline]
pub fn is_client_initiated(stream_id: u64) -> bool {
    stream_id & 0x01 == 0
}

//= https://www.rfc-editor.org/rfc/rfc9000#section-2.1
//# The second least significant bit (0x02) of the stream ID
//# distinguishes between bidirectional streams (with the bit set to 0)
//# and unidirectional streams (with the bit set to 1).
#[inline]
pub fn is_unidirectional(stream_id: u64) -> bool {
    stream_id & 0x02 != 0
}

/// The ordinal of `stream_id` within its type, starting at 0.
#[inline]
pub fn stream_ordinal(stream_id: u64) -> u64 {
    stream_id >> 2
}

/// Misuse of the stream API by the application.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamError {
    FinAlreadySent,
    StreamReset,
    NotWritable,
    NotReadable,
    UnknownStream,
    /// Opening the stream would exceed the peer's MAX_STREAMS limit.
    LimitExceeded,
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::FinAlreadySent => write!(f, "cannot write after FIN"),
            Self::StreamReset => write!(f, "stream was reset"),
            Self::NotWritable => write!(f, "stream is not writable"),
            Self::NotReadable => write!(f, "stream is not readable"),
            Self::UnknownStream => write!(f, "unknown stream"),
            Self::LimitExceeded => write!(f, "peer stream limit reached"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for StreamError {}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SendState {
    #[default]
    Ready,
    Send,
    DataSent,
    DataRecvd,
    ResetSent,
    ResetRecvd,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RecvState {
    #[default]
    Recv,
    SizeKnown,
    DataRecvd,
    DataRead,
    ResetRecvd,
    ResetRead,
}

/// A STREAM frame ready for emission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingData {
    pub offset: u64,
    pub data: Vec<u8>,
    pub fin: bool,
    /// Bytes beyond the previous high-water mark; they consume
    /// connection-level send credit.
    pub new_bytes: u64,
}

/// The sending half of a stream.
pub struct SendStream {
    state: SendState,
    /// Bytes in `[buffer_start, buffer_stop)` not yet fully acknowledged.
    buffer: Vec<u8>,
    buffer_start: u64,
    buffer_stop: u64,
    /// Offsets needing (re)transmission.
    pending: RangeSet,
    /// Offsets acknowledged so far.
    acked: RangeSet,
    highest_sent: u64,
    final_offset: Option<u64>,
    fin_pending: bool,
    fin_acked: bool,
    /// Peer-granted stream credit.
    max_stream_data: u64,
    /// The limit a STREAM_DATA_BLOCKED frame was last sent for.
    blocked_sent_at: Option<u64>,
    /// Reset requested by the application; cleared once the frame is
    /// emitted.
    reset_pending: Option<u64>,
    reset_error_code: Option<u64>,
}

impl SendStream {
    pub fn new(max_stream_data: u64) -> Self {
        Self {
            state: SendState::Ready,
            buffer: Vec::new(),
            buffer_start: 0,
            buffer_stop: 0,
            pending: RangeSet::new(),
            acked: RangeSet::new(),
            highest_sent: 0,
            final_offset: None,
            fin_pending: false,
            fin_acked: false,
            max_stream_data,
            blocked_sent_at: None,
            reset_pending: None,
            reset_error_code: None,
        }
    }

    #[inline]
    pub fn state(&self) -> SendState {
        self.state
    }

    #[inline]
    pub fn bytes_sent(&self) -> u64 {
        self.highest_sent
    }

    #[inline]
    pub fn bytes_acked(&self) -> u64 {
        // contiguous prefix only
        self.buffer_start
    }

    #[inline]
    pub fn max_stream_data(&self) -> u64 {
        self.max_stream_data
    }

    pub fn set_max_stream_data(&mut self, maximum: u64) {
        if maximum > self.max_stream_data {
            self.max_stream_data = maximum;
            self.blocked_sent_at = None;
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, SendState::DataRecvd | SendState::ResetRecvd)
    }

    /// Appends application data, optionally closing the stream.
    pub fn write(&mut self, data: &[u8], fin: bool) -> Result<(), StreamError> {
        match self.state {
            SendState::ResetSent | SendState::ResetRecvd => return Err(StreamError::StreamReset),
            _ if self.final_offset.is_some() => return Err(StreamError::FinAlreadySent),
            _ => {}
        }

        if !data.is_empty() {
            let start = self.buffer_stop;
            self.buffer.extend_from_slice(data);
            self.buffer_stop += data.len() as u64;
            self.pending.insert(start..=self.buffer_stop - 1);
            if self.state == SendState::Ready {
                self.state = SendState::Send;
            }
        }
        if fin {
            self.final_offset = Some(self.buffer_stop);
            self.fin_pending = true;
            self.state = SendState::DataSent;
        }
        Ok(())
    }

    /// Requests a RESET_STREAM with `error_code`.
    pub fn reset(&mut self, error_code: u64) -> Result<(), StreamError> {
        if matches!(self.state, SendState::ResetSent | SendState::ResetRecvd) {
            return Err(StreamError::StreamReset);
        }
        self.reset_pending = Some(error_code);
        self.reset_error_code = Some(error_code);
        self.pending = RangeSet::new();
        self.fin_pending = false;
        self.state = SendState::ResetSent;
        Ok(())
    }

    /// The reset waiting to be emitted, without consuming it.
    pub fn pending_reset(&self) -> Option<(u64, u64)> {
        self.reset_pending.map(|code| (code, self.buffer_stop))
    }

    #[inline]
    pub fn has_pending_reset(&self) -> bool {
        self.reset_pending.is_some()
    }

    /// Takes the pending reset, if one must be emitted.
    pub fn take_pending_reset(&mut self) -> Option<(u64, u64)> {
        self.reset_pending
            .take()
            .map(|code| (code, self.buffer_stop))
    }

    pub fn on_reset_delivery(&mut self, acked: bool) {
        if acked {
            self.state = SendState::ResetRecvd;
        } else if let Some(code) = self.reset_error_code {
            self.reset_pending = Some(code);
        }
    }

    #[inline]
    pub fn has_pending_data(&self) -> bool {
        !self.pending.is_empty() || self.fin_pending
    }

    /// True once a write would exceed the peer's stream credit; the caller
    /// sends STREAM_DATA_BLOCKED at most once per limit.
    pub fn should_send_blocked(&mut self) -> Option<u64> {
        if self.pending.max_value().map_or(false, |max| max >= self.max_stream_data)
            && self.blocked_sent_at != Some(self.max_stream_data)
        {
            self.blocked_sent_at = Some(self.max_stream_data);
            return Some(self.max_stream_data);
        }
        None
    }

    /// Picks the next range to transmit.
    ///
    /// `max_frame_data` caps the frame payload; `connection_allowance` caps
    /// bytes that have never been sent before (connection-level credit).
    pub fn next_frame(
        &mut self,
        max_frame_data: usize,
        connection_allowance: u64,
    ) -> Option<PendingData> {
        if self.reset_error_code.is_some() {
            return None;
        }

        // ranges marked lost can still be acknowledged by their original
        // packet afterwards; anything below the acked prefix is settled
        self.pending.remove_below(self.buffer_start);

        let (start, mut end) = match self.pending.iter().next() {
            Some(range) => (*range.start(), *range.end() + 1),
            None => {
                // a bare FIN still needs a frame
                if self.fin_pending {
                    let offset = self.final_offset.expect("fin implies final offset");
                    self.fin_pending = false;
                    self.state = SendState::DataSent;
                    return Some(PendingData {
                        offset,
                        data: Vec::new(),
                        fin: true,
                        new_bytes: 0,
                    });
                }
                return None;
            }
        };

        end = end.min(start + max_frame_data as u64);
        //= https://www.rfc-editor.org/rfc/rfc9000#section-4.1
        //# A sender MUST NOT send data at or above either the stream or the
        //# connection flow-control limit.
        end = end.min(self.max_stream_data);
        let new_cap = self.highest_sent.saturating_add(connection_allowance);
        end = end.min(new_cap.max(start));

        if end <= start {
            return None;
        }

        let slice_start = (start - self.buffer_start) as usize;
        let slice_end = (end - self.buffer_start) as usize;
        let data = self.buffer[slice_start..slice_end].to_vec();

        self.pending.remove_below(end);
        // bytes between `end` and the old range end stay pending
        let new_bytes = end.saturating_sub(self.highest_sent);
        if end > self.highest_sent {
            self.highest_sent = end;
        }

        let fin = self.fin_pending && Some(end) == self.final_offset;
        if fin {
            self.fin_pending = false;
        }

        Some(PendingData {
            offset: start,
            data,
            fin,
            new_bytes,
        })
    }

    /// Delivery handler for a previously emitted STREAM frame.
    pub fn on_data_delivery(&mut self, acked: bool, start: u64, end: u64, fin: bool) {
        if acked {
            if end > start {
                self.acked.insert(start..=end - 1);
                // drop the fully acknowledged prefix
                loop {
                    let next = self.acked.iter().next().map(|range| (*range.start(), *range.end()));
                    let Some((start, end)) = next else {
                        break;
                    };
                    if start != self.buffer_start {
                        break;
                    }
                    let drop_to = end + 1;
                    let drop_len = (drop_to - self.buffer_start) as usize;
                    self.buffer.drain(..drop_len);
                    self.buffer_start = drop_to;
                    self.acked.remove_below(drop_to);
                }
            }
            if fin {
                self.fin_acked = true;
            }
            if self.fin_acked && Some(self.buffer_start) == self.final_offset {
                self.state = SendState::DataRecvd;
            }
        } else {
            if end > start {
                self.pending.insert(start..=end - 1);
                if self.state == SendState::Ready {
                    self.state = SendState::Send;
                }
            }
            if fin {
                self.fin_pending = true;
            }
        }
    }

    /// STOP_SENDING from the peer: the data is abandoned and a reset goes
    /// out with the peer's error code.
    pub fn on_stop_sending(&mut self, error_code: u64) {
        if !matches!(self.state, SendState::ResetSent | SendState::ResetRecvd) {
            let _ = self.reset(error_code);
        }
    }
}

/// Data delivered to the application by the receiving half.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Delivered {
    pub data: Bytes,
    pub fin: bool,
}

/// The receiving half of a stream.
pub struct RecvStream {
    state: RecvState,
    /// Out-of-order segments keyed by start offset, all above the
    /// watermark.
    segments: BTreeMap<u64, Vec<u8>>,
    /// Everything below this offset was handed to the application.
    watermark: u64,
    highest_offset: u64,
    final_size: Option<u64>,
    fin_delivered: bool,
    /// Credit advertised to the peer.
    max_stream_data_local: u64,
    /// Current autotuned window.
    credit_window: u64,
    /// A MAX_STREAM_DATA frame should be emitted.
    credit_update_pending: bool,
}

/// Windows stop doubling at this size.
const MAX_CREDIT_WINDOW: u64 = 16 * 1024 * 1024;

impl RecvStream {
    pub fn new(max_stream_data_local: u64) -> Self {
        Self {
            state: RecvState::Recv,
            segments: BTreeMap::new(),
            watermark: 0,
            highest_offset: 0,
            final_size: None,
            fin_delivered: false,
            max_stream_data_local,
            credit_window: max_stream_data_local,
            credit_update_pending: false,
        }
    }

    #[inline]
    pub fn state(&self) -> RecvState {
        self.state
    }

    #[inline]
    pub fn highest_offset(&self) -> u64 {
        self.highest_offset
    }

    #[inline]
    pub fn max_stream_data_local(&self) -> u64 {
        self.max_stream_data_local
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, RecvState::DataRead | RecvState::ResetRead)
    }

    /// Takes the pending MAX_STREAM_DATA advertisement, if any.
    pub fn take_credit_update(&mut self) -> Option<u64> {
        if self.credit_update_pending {
            self.credit_update_pending = false;
            Some(self.max_stream_data_local)
        } else {
            None
        }
    }

    pub fn credit_update_needed(&self) -> bool {
        self.credit_update_pending
    }

    /// Re-arms the advertisement after the carrying packet was lost.
    pub fn on_credit_update_lost(&mut self) {
        self.credit_update_pending = true;
    }

    /// Applies a STREAM frame. Returns in-order data newly available to the
    /// application; the FIN flag is reported exactly once.
    pub fn handle_frame(
        &mut self,
        offset: u64,
        data: &[u8],
        fin: bool,
    ) -> Result<Option<Delivered>, TransportError> {
        if matches!(self.state, RecvState::ResetRecvd | RecvState::ResetRead) {
            // data arriving after a reset is discarded
            return Ok(None);
        }

        let frame_end = offset + data.len() as u64;

        //= https://www.rfc-editor.org/rfc/rfc9000#section-4.5
        //# Once a final size for a stream is known, it cannot change.  If a
        //# RESET_STREAM or STREAM frame is received indicating a change in
        //# the final size for the stream, an endpoint MUST respond with an
        //# error of type FINAL_SIZE_ERROR
        if let Some(final_size) = self.final_size {
            if frame_end > final_size || (fin && frame_end != final_size) {
                return Err(TransportError::FINAL_SIZE_ERROR
                    .with_reason("stream final size changed"));
            }
        }
        if fin {
            if frame_end < self.highest_offset {
                return Err(TransportError::FINAL_SIZE_ERROR
                    .with_reason("final size below received data"));
            }
            self.final_size = Some(frame_end);
            if self.state == RecvState::Recv {
                self.state = RecvState::SizeKnown;
            }
        }

        //= https://www.rfc-editor.org/rfc/rfc9000#section-4.1
        //# A receiver MUST close the connection with an error of type
        //# FLOW_CONTROL_ERROR if the sender violates the advertised
        //# connection or stream data limits
        if frame_end > self.max_stream_data_local {
            return Err(TransportError::FLOW_CONTROL_ERROR
                .with_reason("stream data limit exceeded"));
        }

        if frame_end > self.highest_offset {
            self.highest_offset = frame_end;
        }

        // buffer the part above the watermark
        if frame_end > self.watermark && !data.is_empty() {
            let (clip_offset, clip_data) = if offset < self.watermark {
                let skip = (self.watermark - offset) as usize;
                (self.watermark, &data[skip..])
            } else {
                (offset, data)
            };
            // keep the longer of two segments starting at the same offset
            let replace = match self.segments.get(&clip_offset) {
                Some(existing) => existing.len() < clip_data.len(),
                None => true,
            };
            if replace {
                self.segments.insert(clip_offset, clip_data.to_vec());
            }
        }

        // pop everything contiguous with the watermark
        let mut delivered = Vec::new();
        while let Some((&seg_start, _)) = self.segments.first_key_value() {
            if seg_start > self.watermark {
                break;
            }
            let (seg_start, segment) = self.segments.pop_first().expect("peeked");
            let seg_end = seg_start + segment.len() as u64;
            if seg_end > self.watermark {
                let skip = (self.watermark - seg_start) as usize;
                delivered.extend_from_slice(&segment[skip..]);
                self.watermark = seg_end;
            }
        }

        let fin_now = self.final_size == Some(self.watermark) && !self.fin_delivered;
        if fin_now {
            self.fin_delivered = true;
            self.state = RecvState::DataRead;
        }

        if delivered.is_empty() && !fin_now {
            return Ok(None);
        }
        self.on_delivered();
        Ok(Some(Delivered {
            data: Bytes::from(delivered),
            fin: fin_now,
        }))
    }

    /// Applies a RESET_STREAM frame.
    pub fn handle_reset(&mut self, final_size: u64) -> Result<bool, TransportError> {
        if let Some(existing) = self.final_size {
            if existing != final_size {
                return Err(TransportError::FINAL_SIZE_ERROR
                    .with_reason("reset changed the final size"));
            }
        }
        if final_size < self.highest_offset {
            return Err(
                TransportError::FINAL_SIZE_ERROR.with_reason("final size below received data")
            );
        }
        self.final_size = Some(final_size);
        self.highest_offset = final_size;
        self.segments.clear();

        let newly_reset = !matches!(self.state, RecvState::ResetRecvd | RecvState::ResetRead);
        self.state = RecvState::ResetRead;
        Ok(newly_reset)
    }

    /// Grows the advertised window once the application consumed half of
    /// it.
    fn on_delivered(&mut self) {
        let consumed_into_window = self
            .watermark
            .saturating_sub(self.max_stream_data_local.saturating_sub(self.credit_window));
        if consumed_into_window * 2 > self.credit_window && self.final_size.is_none() {
            self.credit_window = (self.credit_window * 2).min(MAX_CREDIT_WINDOW);
            self.max_stream_data_local = self.watermark + self.credit_window;
            self.credit_update_pending = true;
        }
    }
}

/// A stream: up to two directions of state plus its identifier.
pub struct Stream {
    pub id: u64,
    pub sender: Option<SendStream>,
    pub receiver: Option<RecvStream>,
}

impl Stream {
    pub fn new(id: u64, sender: Option<SendStream>, receiver: Option<RecvStream>) -> Self {
        Self {
            id,
            sender,
            receiver,
        }
    }

    /// Both configured directions reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.sender.as_ref().map_or(true, SendStream::is_terminal)
            && self
                .receiver
                .as_ref()
                .map_or(true, RecvStream::is_terminal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_arithmetic() {
        // client bidi 0, server bidi 1, client uni 2, server uni 3
        assert!(is_client_initiated(0));
        assert!(!is_client_initiated(1));
        assert!(!is_unidirectional(0));
        assert!(is_unidirectional(2));
        assert_eq!(stream_ordinal(0), 0);
        assert_eq!(stream_ordinal(4), 1);
        assert_eq!(stream_ordinal(9), 2);
    }

    #[test]
    fn send_write_then_drain() {
        let mut send = SendStream::new(1 << 20);
        send.write(b"hello world", true).unwrap();
        assert_eq!(send.state(), SendState::DataSent);

        let frame = send.next_frame(1024, u64::MAX).unwrap();
        assert_eq!(frame.offset, 0);
        assert_eq!(frame.data, b"hello world");
        assert!(frame.fin);
        assert_eq!(frame.new_bytes, 11);
        assert!(send.next_frame(1024, u64::MAX).is_none());

        send.on_data_delivery(true, 0, 11, true);
        assert_eq!(send.state(), SendState::DataRecvd);
        assert_eq!(send.bytes_acked(), 11);
        assert!(send.is_terminal());
    }

    #[test]
    fn send_respects_frame_and_credit_caps() {
        let mut send = SendStream::new(10);
        send.write(b"0123456789abcdef", false).unwrap();

        // stream credit caps at 10 bytes
        let frame = send.next_frame(1024, u64::MAX).unwrap();
        assert_eq!(frame.data.len(), 10);
        assert_eq!(send.should_send_blocked(), Some(10));
        // only once per limit
        assert_eq!(send.should_send_blocked(), None);

        // raising the limit unblocks and allows the rest
        send.set_max_stream_data(100);
        let frame = send.next_frame(4, u64::MAX).unwrap();
        assert_eq!(frame.offset, 10);
        assert_eq!(frame.data.len(), 4);

        // connection allowance caps new bytes
        let frame = send.next_frame(1024, 1).unwrap();
        assert_eq!(frame.data.len(), 1);
        assert_eq!(frame.new_bytes, 1);
    }

    #[test]
    fn lost_frames_are_retransmitted_from_the_buffer() {
        let mut send = SendStream::new(1 << 20);
        send.write(b"abcdefgh", true).unwrap();
        let first = send.next_frame(4, u64::MAX).unwrap();
        let second = send.next_frame(4, u64::MAX).unwrap();
        assert_eq!(first.data, b"abcd");
        assert_eq!(second.data, b"efgh");
        assert!(second.fin);

        // first frame lost: its range re-enters the pending set
        send.on_data_delivery(false, 0, 4, false);
        let retransmit = send.next_frame(1024, 0).unwrap();
        assert_eq!(retransmit.offset, 0);
        assert_eq!(retransmit.data, b"abcd");
        assert_eq!(retransmit.new_bytes, 0);

        send.on_data_delivery(true, 4, 8, true);
        send.on_data_delivery(true, 0, 4, false);
        assert_eq!(send.state(), SendState::DataRecvd);
    }

    #[test]
    fn bare_fin_gets_a_frame() {
        let mut send = SendStream::new(64);
        send.write(b"", true).unwrap();
        let frame = send.next_frame(64, 0).unwrap();
        assert_eq!(frame.offset, 0);
        assert!(frame.data.is_empty());
        assert!(frame.fin);

        // lost FIN is re-armed by the delivery handler
        send.on_data_delivery(false, 0, 0, true);
        assert!(send.has_pending_data());
        let again = send.next_frame(64, 0).unwrap();
        assert!(again.fin);
    }

    #[test]
    fn recv_reorders_and_delivers_in_order() {
        let mut recv = RecvStream::new(1 << 20);
        // second half arrives first
        assert_eq!(recv.handle_frame(5, b" world", false).unwrap(), None);
        let delivered = recv.handle_frame(0, b"hello", false).unwrap().unwrap();
        assert_eq!(&delivered.data[..], b"hello world");
        assert!(!delivered.fin);

        // duplicates are accepted silently
        assert_eq!(recv.handle_frame(0, b"hello", false).unwrap(), None);

        let delivered = recv.handle_frame(11, b"", true).unwrap().unwrap();
        assert!(delivered.data.is_empty());
        assert!(delivered.fin);
        assert_eq!(recv.state(), RecvState::DataRead);

        // fin is reported exactly once
        assert_eq!(recv.handle_frame(11, b"", true).unwrap(), None);
    }

    #[test]
    fn recv_final_size_is_fixed_once_observed() {
        let mut recv = RecvStream::new(1 << 20);
        recv.handle_frame(0, b"abc", true).unwrap();
        // same fin again is fine
        assert!(recv.handle_frame(0, b"abc", true).is_ok());
        // a different final size is fatal
        let error = recv.handle_frame(0, b"abcd", true).unwrap_err();
        assert_eq!(error.code, TransportError::FINAL_SIZE_ERROR.code);
        // data beyond the final size is fatal
        let error = recv.handle_frame(3, b"x", false).unwrap_err();
        assert_eq!(error.code, TransportError::FINAL_SIZE_ERROR.code);
    }

    #[test]
    fn recv_enforces_stream_flow_control() {
        let mut recv = RecvStream::new(8);
        let error = recv.handle_frame(0, b"123456789", false).unwrap_err();
        assert_eq!(error.code, TransportError::FLOW_CONTROL_ERROR.code);
    }

    #[test]
    fn recv_window_doubles_at_half_consumption() {
        let mut recv = RecvStream::new(16);
        recv.handle_frame(0, &[0u8; 9], false).unwrap();
        // 9 of 16 bytes consumed: the window doubles and re-advertises
        let update = recv.take_credit_update().expect("update scheduled");
        assert_eq!(update, 9 + 32);
        assert!(recv.take_credit_update().is_none());
    }

    #[test]
    fn reset_supersedes_buffered_data() {
        let mut recv = RecvStream::new(1 << 20);
        recv.handle_frame(2, b"cd", false).unwrap();
        assert!(recv.handle_reset(4).unwrap());
        assert_eq!(recv.state(), RecvState::ResetRead);
        // repeated reset is not news
        assert!(!recv.handle_reset(4).unwrap());
        // and an inconsistent one is fatal
        assert!(recv.handle_reset(5).is_err());
    }

    #[test]
    fn stop_sending_turns_into_reset() {
        let mut send = SendStream::new(64);
        send.write(b"abc", false).unwrap();
        send.on_stop_sending(42);
        assert_eq!(send.state(), SendState::ResetSent);
        assert_eq!(send.take_pending_reset(), Some((42, 3)));
        assert!(send.next_frame(64, u64::MAX).is_none());
        send.on_reset_delivery(true);
        assert!(send.is_terminal());
    }
}
