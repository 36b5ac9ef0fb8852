// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Packet builder: frames into packets, packets into coalesced datagrams.
//!
//! A builder lives for a single send pass. The connection starts a packet
//! per epoch, writes pending frames into the builder's cursor, and flushes;
//! the builder enforces the congestion and amplification byte caps, applies
//! the padding rules, seals each packet with the epoch's crypto pair and
//! returns the finished datagrams plus the sent-packet records recovery
//! needs.

use crate::{
    cid::ConnectionId,
    crypto::{CryptoPair, Epoch},
    frame,
    packet::{
        encode_long_header_first_byte, long_header_size, short_header_size, PacketType,
        PACKET_FIXED_BIT, PACKET_NUMBER_MAX_SIZE, PACKET_NUMBER_SEND_SIZE,
    },
    time::Timestamp,
};
use bytes::Bytes;
use skein_codec::{Buffer, BufferError};
use smallvec::SmallVec;

/// Raised when the current write pass ran out of buffer or flight budget.
/// The caller stops writing; it is not an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BuilderStop;

impl From<BufferError> for BuilderStop {
    fn from(_: BufferError) -> Self {
        BuilderStop
    }
}

/// Fired for each registered frame when its packet is acknowledged or
/// declared lost.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Acked,
    Lost,
}

/// A value-typed description of the intent a sent frame carried.
///
/// Recovery replays intents instead of bytes: on loss the connection
/// re-enqueues the logical operation, on acknowledgement it settles it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryIntent {
    /// An ACK frame acknowledging everything up to `largest_acked`.
    Ack { epoch: Epoch, largest_acked: u64 },
    /// A CRYPTO frame covering `offsets` of the epoch's handshake stream.
    Crypto {
        epoch: Epoch,
        start: u64,
        end: u64,
    },
    /// A STREAM frame covering `start..end`, optionally FIN.
    Stream {
        stream_id: u64,
        start: u64,
        end: u64,
        fin: bool,
    },
    MaxData,
    MaxStreamData { stream_id: u64 },
    MaxStreams { bidirectional: bool },
    Ping { uid: u64 },
    ResetStream { stream_id: u64 },
    StopSending { stream_id: u64, error_code: u64 },
    NewConnectionId { sequence: u64 },
    RetireConnectionId { sequence: u64 },
    NewToken { token: Bytes },
    HandshakeDone,
}

/// Record of one emitted packet, owned by its packet number space until
/// acknowledged or lost.
#[derive(Debug)]
pub struct SentPacket {
    pub epoch: Epoch,
    pub in_flight: bool,
    pub is_ack_eliciting: bool,
    pub is_crypto_packet: bool,
    pub packet_number: u64,
    pub packet_type: PacketType,
    pub sent_time: Option<Timestamp>,
    pub sent_bytes: usize,
    pub delivery_handlers: SmallVec<[DeliveryIntent; 4]>,
}

/// Immutable inputs for one send pass.
pub struct BuilderConfig {
    pub host_cid: ConnectionId,
    pub peer_cid: ConnectionId,
    pub version: u32,
    pub is_client: bool,
    pub packet_number: u64,
    pub peer_token: Bytes,
    pub spin_bit: bool,
}

/// If the tail of a datagram is smaller than this, a new packet opens a
/// fresh datagram instead of coalescing. The limit is arbitrary.
const DATAGRAM_MIN_REMAINING: usize = 128;

pub struct PacketBuilder<'a> {
    /// Congestion budget for this pass; `None` means unlimited.
    pub max_flight_bytes: Option<usize>,
    /// Amplification budget for this pass; `None` once the peer address is
    /// validated.
    pub max_total_bytes: Option<usize>,

    host_cid: ConnectionId,
    peer_cid: ConnectionId,
    version: u32,
    is_client: bool,
    peer_token: Bytes,
    spin_bit: bool,

    datagrams: Vec<Vec<u8>>,
    packets: Vec<SentPacket>,
    datagram_flight_bytes: usize,
    datagram_init: bool,
    datagram_needs_padding: bool,
    flight_bytes: usize,
    total_bytes: usize,

    header_size: usize,
    packet: Option<SentPacket>,
    packet_crypto: Option<&'a CryptoPair>,
    packet_number: u64,
    packet_start: usize,
    packet_type: PacketType,

    buffer: Buffer,
    buffer_capacity: usize,
    flight_capacity: usize,
}

impl<'a> PacketBuilder<'a> {
    pub fn new(config: BuilderConfig, buffer_capacity: usize) -> Self {
        Self {
            max_flight_bytes: None,
            max_total_bytes: None,
            host_cid: config.host_cid,
            peer_cid: config.peer_cid,
            version: config.version,
            is_client: config.is_client,
            peer_token: config.peer_token,
            spin_bit: config.spin_bit,
            datagrams: Vec::new(),
            packets: Vec::new(),
            datagram_flight_bytes: 0,
            datagram_init: true,
            datagram_needs_padding: false,
            flight_bytes: 0,
            total_bytes: 0,
            header_size: 0,
            packet: None,
            packet_crypto: None,
            packet_number: config.packet_number,
            packet_start: 0,
            packet_type: PacketType::Initial,
            buffer: Buffer::new(buffer_capacity),
            buffer_capacity,
            flight_capacity: buffer_capacity,
        }
    }

    /// True when nothing has been written into the current packet.
    pub fn packet_is_empty(&self) -> bool {
        debug_assert!(self.packet.is_some());
        self.buffer.tell() - self.packet_start <= self.header_size
    }

    /// The packet number the next emitted packet will carry.
    pub fn packet_number(&self) -> u64 {
        self.packet_number
    }

    /// Bytes still writable in the current packet under the total budget.
    pub fn remaining_buffer_space(&self) -> usize {
        self.buffer_capacity
            .saturating_sub(self.buffer.tell())
            .saturating_sub(self.tag_size())
    }

    /// Bytes still writable in the current packet under the flight budget.
    pub fn remaining_flight_space(&self) -> usize {
        self.flight_capacity
            .saturating_sub(self.buffer.tell())
            .saturating_sub(self.tag_size())
    }

    fn tag_size(&self) -> usize {
        self.packet_crypto
            .map(|crypto| crypto.aead_tag_size())
            .unwrap_or(0)
    }

    /// Starts a frame of `frame_type` needing at least `capacity` bytes
    /// (type byte included) and returns the cursor to write its body.
    ///
    /// Registers `handler` on the current packet to be fired when the packet
    /// is acknowledged or lost.
    pub fn start_frame(
        &mut self,
        frame_type: u64,
        capacity: usize,
        handler: Option<DeliveryIntent>,
    ) -> Result<&mut Buffer, BuilderStop> {
        let in_flight = frame::is_in_flight(frame_type);
        if self.remaining_buffer_space() < capacity
            || (in_flight && self.remaining_flight_space() < capacity)
        {
            return Err(BuilderStop);
        }

        let packet = self.packet.as_mut().expect("no packet started");
        self.buffer.put_var(frame_type)?;
        if frame::is_ack_eliciting(frame_type) {
            packet.is_ack_eliciting = true;
        }
        if in_flight {
            packet.in_flight = true;
        }
        if frame_type == frame::type_id::CRYPTO {
            packet.is_crypto_packet = true;
        }
        if let Some(handler) = handler {
            packet.delivery_handlers.push(handler);
        }
        Ok(&mut self.buffer)
    }

    /// The cursor for the current frame, for callers that need to continue
    /// writing after `start_frame` returned.
    pub fn buffer(&mut self) -> &mut Buffer {
        &mut self.buffer
    }

    /// Starts a new packet, ending any open one.
    pub fn start_packet(
        &mut self,
        packet_type: PacketType,
        crypto: &'a CryptoPair,
    ) -> Result<(), BuilderStop> {
        debug_assert!(
            !matches!(
                packet_type,
                PacketType::Retry | PacketType::VersionNegotiation
            ),
            "invalid packet type"
        );

        if self.packet.is_some() {
            self.end_packet();
        }

        // if too little space remains, start a new datagram
        let mut packet_start = self.buffer.tell();
        if self.buffer_capacity - packet_start < DATAGRAM_MIN_REMAINING {
            self.flush_current_datagram();
            packet_start = 0;
        }

        if self.datagram_init {
            if let Some(max_total_bytes) = self.max_total_bytes {
                let remaining_total = max_total_bytes.saturating_sub(self.total_bytes);
                if remaining_total < self.buffer_capacity {
                    self.buffer_capacity = remaining_total;
                }
            }
            self.flight_capacity = self.buffer_capacity;
            if let Some(max_flight_bytes) = self.max_flight_bytes {
                let remaining_flight = max_flight_bytes.saturating_sub(self.flight_bytes);
                if remaining_flight < self.flight_capacity {
                    self.flight_capacity = remaining_flight;
                }
            }
            self.datagram_flight_bytes = 0;
            self.datagram_init = false;
            self.datagram_needs_padding = false;
        }

        let header_size = if packet_type.is_long_header() {
            long_header_size(packet_type, &self.peer_cid, &self.host_cid, &self.peer_token)
        } else {
            short_header_size(&self.peer_cid)
        };

        if packet_start + header_size >= self.buffer_capacity {
            return Err(BuilderStop);
        }

        let epoch = match packet_type {
            PacketType::Initial => Epoch::Initial,
            PacketType::Handshake => Epoch::Handshake,
            _ => Epoch::OneRtt,
        };

        self.header_size = header_size;
        self.packet = Some(SentPacket {
            epoch,
            in_flight: false,
            is_ack_eliciting: false,
            is_crypto_packet: false,
            packet_number: self.packet_number,
            packet_type,
            sent_time: None,
            sent_bytes: 0,
            delivery_handlers: SmallVec::new(),
        });
        self.packet_crypto = Some(crypto);
        self.packet_start = packet_start;
        self.packet_type = packet_type;
        self.buffer
            .seek(packet_start + header_size)
            .expect("header fits the checked capacity");
        Ok(())
    }

    /// Ends any open packet, flushes the trailing datagram and returns the
    /// assembled datagrams with their sent-packet records.
    pub fn flush(&mut self) -> (Vec<Vec<u8>>, Vec<SentPacket>) {
        if self.packet.is_some() {
            self.end_packet();
        }
        self.flush_current_datagram();
        (
            core::mem::take(&mut self.datagrams),
            core::mem::take(&mut self.packets),
        )
    }

    fn end_packet(&mut self) {
        // the pair stays installed until the end: the remaining-space
        // calculations below still need its tag size
        let crypto = self.packet_crypto.expect("packet has a crypto pair");
        let mut packet = self.packet.take().expect("packet started");
        let mut packet_size = self.buffer.tell() - self.packet_start;

        if packet_size <= self.header_size {
            // cancel: nothing but the header was written
            self.buffer
                .seek(self.packet_start)
                .expect("seek back to packet start");
            self.packet_crypto = None;
            return;
        }

        // padding so the encrypted payload covers the header-protection
        // sample window
        let mut padding_size = (PACKET_NUMBER_MAX_SIZE - PACKET_NUMBER_SEND_SIZE
            + self.header_size)
            .saturating_sub(packet_size);

        //= https://www.rfc-editor.org/rfc/rfc9000#section-14.1
        //# A client MUST expand the payload of all UDP datagrams carrying
        //# Initial packets to at least the smallest allowed maximum datagram
        //# size of 1200 bytes
        if (self.is_client || packet.is_ack_eliciting)
            && self.packet_type == PacketType::Initial
        {
            self.datagram_needs_padding = true;
        }

        // datagrams holding 1-RTT data pad inside the packet; bytes cannot
        // be tacked on after a short-header packet
        if self.datagram_needs_padding && self.packet_type == PacketType::OneRtt {
            if self.remaining_flight_space() > padding_size {
                padding_size = self.remaining_flight_space();
            }
            self.datagram_needs_padding = false;
        }

        if padding_size > 0 {
            self.buffer
                .put_zeroes(padding_size)
                .expect("padding fits the checked capacity");
            packet_size += padding_size;
            packet.in_flight = true;
        }

        // write the header in place
        let tag_size = crypto.aead_tag_size();
        self.buffer
            .seek(self.packet_start)
            .expect("seek back to packet start");
        if self.packet_type.is_long_header() {
            let length = packet_size - self.header_size + PACKET_NUMBER_SEND_SIZE + tag_size;
            self.buffer
                .put_u8(encode_long_header_first_byte(
                    self.packet_type,
                    (PACKET_NUMBER_SEND_SIZE - 1) as u8,
                ))
                .expect("header fits");
            self.buffer.put_u32(self.version).expect("header fits");
            self.buffer
                .put_u8(self.peer_cid.len() as u8)
                .expect("header fits");
            self.buffer
                .put_bytes(self.peer_cid.as_ref())
                .expect("header fits");
            self.buffer
                .put_u8(self.host_cid.len() as u8)
                .expect("header fits");
            self.buffer
                .put_bytes(self.host_cid.as_ref())
                .expect("header fits");
            if self.packet_type == PacketType::Initial {
                self.buffer
                    .put_var_bytes(&self.peer_token)
                    .expect("header fits");
            }
            self.buffer
                .put_u16(length as u16 | 0x4000)
                .expect("header fits");
            self.buffer
                .put_u16((packet.packet_number & 0xffff) as u16)
                .expect("header fits");
        } else {
            self.buffer
                .put_u8(
                    PACKET_FIXED_BIT
                        | (self.spin_bit as u8) << 5
                        | crypto.key_phase() << 2
                        | (PACKET_NUMBER_SEND_SIZE - 1) as u8,
                )
                .expect("header fits");
            self.buffer
                .put_bytes(self.peer_cid.as_ref())
                .expect("header fits");
            self.buffer
                .put_u16((packet.packet_number & 0xffff) as u16)
                .expect("header fits");
        }

        // seal in place
        let plain = self
            .buffer
            .data_slice(self.packet_start, self.packet_start + packet_size)
            .expect("packet bytes are in bounds")
            .to_vec();
        let sealed = crypto.encrypt_packet(
            &plain[..self.header_size],
            &plain[self.header_size..],
            packet.packet_number,
            PACKET_NUMBER_SEND_SIZE,
        );
        self.buffer
            .seek(self.packet_start)
            .expect("seek back to packet start");
        self.buffer
            .put_bytes(&sealed)
            .expect("sealed packet fits the reserved tag space");

        self.packet_crypto = None;
        packet.sent_bytes = self.buffer.tell() - self.packet_start;
        if packet.in_flight {
            self.datagram_flight_bytes += packet.sent_bytes;
        }
        let is_one_rtt = self.packet_type == PacketType::OneRtt;
        self.packets.push(packet);

        //= https://www.rfc-editor.org/rfc/rfc9000#section-12.2
        //# a packet with a short header does not include a length, so it can
        //# only be the last packet included in a UDP datagram
        if is_one_rtt {
            self.flush_current_datagram();
        }

        self.packet_number += 1;
    }

    fn flush_current_datagram(&mut self) {
        let mut datagram_bytes = self.buffer.tell();
        if datagram_bytes == 0 {
            return;
        }

        // expand datagrams carrying client Initial packets to 1200 bytes
        if self.datagram_needs_padding {
            let extra = self.flight_capacity.saturating_sub(self.buffer.tell());
            if extra > 0 {
                self.buffer
                    .put_zeroes(extra)
                    .expect("padding stays within capacity");
                self.datagram_flight_bytes += extra;
                datagram_bytes += extra;
            }
        }

        self.datagrams.push(self.buffer.data().to_vec());
        self.flight_bytes += self.datagram_flight_bytes;
        self.total_bytes += datagram_bytes;
        self.datagram_init = true;
        self.buffer.seek(0).expect("rewind");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::testing::null_key_set;
    use crate::frame::type_id;

    const CAPACITY: usize = 1280;

    fn builder_config(is_client: bool) -> BuilderConfig {
        BuilderConfig {
            host_cid: ConnectionId::try_from_slice(&[1; 8]).unwrap(),
            peer_cid: ConnectionId::try_from_slice(&[2; 8]).unwrap(),
            version: 1,
            is_client,
            packet_number: 0,
            peer_token: Bytes::new(),
            spin_bit: false,
        }
    }

    fn initial_pair() -> CryptoPair {
        CryptoPair::new(null_key_set(&[2; 8], Epoch::Initial))
    }

    fn one_rtt_pair() -> CryptoPair {
        CryptoPair::new(null_key_set(b"application", Epoch::OneRtt))
    }

    #[test]
    fn client_initial_datagram_is_padded_to_capacity() {
        let crypto = initial_pair();
        let mut builder = PacketBuilder::new(builder_config(true), CAPACITY);
        builder.start_packet(PacketType::Initial, &crypto).unwrap();
        let buf = builder
            .start_frame(type_id::CRYPTO, 8, None)
            .unwrap();
        buf.put_var(0).unwrap();
        buf.put_var_bytes(b"hello").unwrap();

        let (datagrams, packets) = builder.flush();
        assert_eq!(datagrams.len(), 1);
        assert_eq!(datagrams[0].len(), CAPACITY);
        assert_eq!(packets.len(), 1);
        assert!(packets[0].is_ack_eliciting);
        assert!(packets[0].in_flight);
        assert!(packets[0].is_crypto_packet);
        assert_eq!(packets[0].packet_number, 0);
    }

    #[test]
    fn empty_packet_is_cancelled() {
        let crypto = initial_pair();
        let mut builder = PacketBuilder::new(builder_config(true), CAPACITY);
        builder.start_packet(PacketType::Initial, &crypto).unwrap();
        assert!(builder.packet_is_empty());
        let (datagrams, packets) = builder.flush();
        assert!(datagrams.is_empty());
        assert!(packets.is_empty());
    }

    #[test]
    fn long_header_packets_coalesce_and_short_header_terminates() {
        let initial = initial_pair();
        let handshake = CryptoPair::new(null_key_set(b"handshake", Epoch::Handshake));
        let one_rtt = one_rtt_pair();

        let mut builder = PacketBuilder::new(builder_config(false), CAPACITY);

        builder.start_packet(PacketType::Initial, &initial).unwrap();
        let buf = builder.start_frame(type_id::CRYPTO, 8, None).unwrap();
        buf.put_var(0).unwrap();
        buf.put_var_bytes(b"server hello").unwrap();

        builder
            .start_packet(PacketType::Handshake, &handshake)
            .unwrap();
        let buf = builder.start_frame(type_id::CRYPTO, 8, None).unwrap();
        buf.put_var(0).unwrap();
        buf.put_var_bytes(b"finished").unwrap();

        builder.start_packet(PacketType::OneRtt, &one_rtt).unwrap();
        let buf = builder.start_frame(type_id::PING, 1, None).unwrap();
        let _ = buf;

        builder.start_packet(PacketType::OneRtt, &one_rtt).unwrap();
        let buf = builder.start_frame(type_id::PING, 1, None).unwrap();
        let _ = buf;

        let (datagrams, packets) = builder.flush();
        // initial+handshake+1-RTT coalesce; the second 1-RTT packet opens a
        // fresh datagram
        assert_eq!(datagrams.len(), 2);
        assert_eq!(packets.len(), 4);
        assert_eq!(
            packets.iter().map(|p| p.packet_number).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
    }

    #[test]
    fn flight_budget_stops_the_pass() {
        let crypto = one_rtt_pair();
        let mut builder = PacketBuilder::new(builder_config(true), CAPACITY);
        builder.max_flight_bytes = Some(64);
        builder.start_packet(PacketType::OneRtt, &crypto).unwrap();

        // ACK frames ignore the flight budget
        assert!(builder.start_frame(type_id::ACK, 16, None).is_ok());
        let buf = builder.buffer();
        buf.put_var(0).unwrap();
        buf.put_var(0).unwrap();
        buf.put_var(0).unwrap();
        buf.put_var(0).unwrap();

        // a large stream frame does not fit the 64-byte flight budget
        assert_eq!(
            builder.start_frame(type_id::STREAM_BASE, 600, None).unwrap_err(),
            BuilderStop
        );
    }

    #[test]
    fn amplification_budget_caps_the_datagram() {
        let crypto = initial_pair();
        let mut builder = PacketBuilder::new(builder_config(false), CAPACITY);
        builder.max_total_bytes = Some(300);
        builder.start_packet(PacketType::Initial, &crypto).unwrap();
        let buf = builder.start_frame(type_id::CRYPTO, 8, None).unwrap();
        buf.put_var(0).unwrap();
        buf.put_var_bytes(&[0x5a; 180]).unwrap();

        // no more than 300 - written bytes remain
        assert!(builder.remaining_buffer_space() < 300);
        let (datagrams, _) = builder.flush();
        assert_eq!(datagrams.len(), 1);
        assert!(datagrams[0].len() <= 300);
    }

    #[test]
    fn sampling_padding_keeps_minimum_payload() {
        // a packet with a 1-byte payload must be padded so the header
        // protection sample exists
        let crypto = one_rtt_pair();
        let mut builder = PacketBuilder::new(builder_config(true), CAPACITY);
        builder.start_packet(PacketType::OneRtt, &crypto).unwrap();
        builder.start_frame(type_id::PING, 1, None).unwrap();
        let (datagrams, packets) = builder.flush();
        let header_size = 3 + 8;
        assert_eq!(packets[0].sent_bytes, datagrams[0].len());
        assert!(
            datagrams[0].len()
                >= header_size + (PACKET_NUMBER_MAX_SIZE - PACKET_NUMBER_SEND_SIZE) + 16
        );
    }

    #[test]
    fn delivery_handlers_attach_to_the_packet() {
        let crypto = one_rtt_pair();
        let mut builder = PacketBuilder::new(builder_config(true), CAPACITY);
        builder.start_packet(PacketType::OneRtt, &crypto).unwrap();
        let buf = builder
            .start_frame(
                type_id::PING,
                1,
                Some(DeliveryIntent::Ping { uid: 77 }),
            )
            .unwrap();
        let _ = buf;
        let (_, packets) = builder.flush();
        assert_eq!(
            packets[0].delivery_handlers.as_slice(),
            &[DeliveryIntent::Ping { uid: 77 }]
        );
    }
}
