// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Inbound datagram processing: header parse, epoch lookup, decryption,
//! frame dispatch.

use super::{frame_allowed_in_epoch, Connection, State};
use crate::{
    cid::{CidSlot, ConnectionId},
    crypto::Epoch,
    event::Event,
    frame::{self, type_id, Frame},
    packet::{pull_header, retry_pseudo_packet, spin_bit, Header, PacketType},
    stream::{is_client_initiated, is_unidirectional, stream_ordinal, RecvStream, SendStream, Stream},
    time::Timestamp,
    transport::error::TransportError,
};
use skein_codec::Buffer;
use std::net::SocketAddr;
use subtle::ConstantTimeEq;

impl Connection {
    /// Consumes one UDP payload received from `addr`.
    pub fn receive_datagram(&mut self, data: &[u8], addr: SocketAddr, now: Timestamp) {
        match self.state {
            State::Terminated | State::Draining => return,
            State::Closing => {
                //= https://www.rfc-editor.org/rfc/rfc9000#section-10.2.1
                //# An endpoint that chooses not to retransmit packets
                //# containing a CONNECTION_CLOSE frame risks a peer missing
                //# the first such packet ... an endpoint SHOULD limit the
                //# number of packets it generates containing a
                //# CONNECTION_CLOSE frame.
                let resend_after = self.recovery.rtt.pto_period(true) / 4;
                if self
                    .close_last_sent
                    .map_or(true, |t| now.saturating_duration_since(t) >= resend_after)
                {
                    self.close_pending = true;
                }
                return;
            }
            _ => {}
        }

        self.bytes_received_total += data.len();

        if self.is_stateless_reset(data) {
            self.emit_terminated(0, None, "Stateless reset");
            self.state = State::Terminated;
            return;
        }

        let mut buf = Buffer::from_slice(data);
        while !buf.is_at_end() {
            let packet_start = buf.tell();
            let header = match pull_header(&mut buf, self.config.connection_id_length) {
                Ok(header) => header,
                Err(_) => {
                    self.trace.on_packet_dropped("malformed header");
                    return;
                }
            };

            match header.packet_type {
                PacketType::VersionNegotiation => {
                    self.on_version_negotiation(&header);
                    return;
                }
                PacketType::Retry => {
                    self.on_retry(&header, data, packet_start);
                    return;
                }
                PacketType::ZeroRtt => {
                    // early data is not supported; skip the packet
                    let end = header.pn_offset + header.rest_length;
                    if buf.seek(end).is_err() {
                        return;
                    }
                    continue;
                }
                _ => {}
            }

            if header.is_long_header() {
                if !self.is_client && !self.config.supported_versions.contains(&header.version) {
                    //= https://www.rfc-editor.org/rfc/rfc9000#section-6.1
                    //# a server sends a Version Negotiation packet in response
                    //# to each packet that might initiate a new connection
                    self.pending_vn_response = Some(crate::packet::encode_version_negotiation(
                        &header.source_cid,
                        &header.destination_cid,
                        &self.config.supported_versions,
                        {
                            let mut byte = [0u8; 1];
                            self.rng.public_random_fill(&mut byte);
                            byte[0]
                        },
                    ));
                    return;
                }
                if header.version != self.version {
                    self.trace.on_packet_dropped("version mismatch");
                    return;
                }
            }

            let epoch = match header.packet_type {
                PacketType::Initial => Epoch::Initial,
                PacketType::Handshake => Epoch::Handshake,
                _ => Epoch::OneRtt,
            };
            let end = header.pn_offset + header.rest_length;

            if self.process_protected_packet(&header, data, packet_start, end, epoch, addr, now) {
                // fatal error or terminal state; stop parsing the datagram
                if !self.is_live() {
                    return;
                }
            }

            if buf.seek(end).is_err() {
                return;
            }
        }
    }

    /// Returns true when the datagram tail matches a stateless reset token
    /// advertised by the peer.
    fn is_stateless_reset(&self, data: &[u8]) -> bool {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-10.3
        //# A stateless reset uses an entire UDP datagram, starting with the
        //# first two bits of the packet header ... the remainder of the
        //# first byte and an arbitrary number of bytes following it are set
        //# to values that SHOULD be indistinguishable from random.
        if data.len() < 21 || data[0] & 0x80 != 0 {
            return false;
        }
        let tail: &[u8; 16] = data[data.len() - 16..].try_into().expect("16 byte tail");
        self.peer_reset_tokens
            .iter()
            .any(|token| bool::from(token.ct_eq(tail)))
    }

    fn on_version_negotiation(&mut self, header: &Header) {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-6.2
        //# A client MUST discard a Version Negotiation packet that lists the
        //# QUIC version selected by the client.
        if !self.is_client
            || self.state != State::FirstFlight
            || self.spaces[Epoch::Initial as usize]
                .largest_received_packet
                .is_some()
            || header.supported_versions.contains(&self.version)
        {
            return;
        }

        let chosen = self
            .config
            .supported_versions
            .iter()
            .copied()
            .find(|v| header.supported_versions.contains(v));
        let Some(version) = chosen else {
            self.emit_terminated(
                TransportError::INTERNAL_ERROR.code,
                None,
                "Could not find a common protocol version",
            );
            self.state = State::Terminated;
            return;
        };

        self.version = version;
        let peer_cid = self.active_peer_cid();
        self.setup_initial_crypto(peer_cid);
        self.rewind_first_flight();
    }

    fn on_retry(&mut self, header: &Header, datagram: &[u8], packet_start: usize) {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-17.2.5.2
        //# A client MUST accept and process at most one Retry packet for
        //# each connection attempt.
        if !self.is_client
            || self.state != State::FirstFlight
            || self.retry_accepted
            || self.spaces[Epoch::Initial as usize]
                .largest_received_packet
                .is_some()
            || header.token.is_empty()
        {
            return;
        }
        if header.destination_cid != self.host_cids[0].cid {
            return;
        }

        let without_tag = &datagram[packet_start..datagram.len() - 16];
        let pseudo = retry_pseudo_packet(&self.active_peer_cid(), without_tag);
        if !self.tls.verify_retry(&pseudo, &header.integrity_tag) {
            self.trace.on_packet_dropped("retry integrity mismatch");
            return;
        }

        self.retry_accepted = true;
        self.retry_source_cid = Some(header.source_cid);
        self.peer_token = header.token.clone();
        if let Some(slot) = self.peer_cids.first_mut() {
            slot.cid = header.source_cid;
        }
        //= https://www.rfc-editor.org/rfc/rfc9001#section-5.2
        //# The client then uses the Source Connection ID from the server's
        //# Retry packet in the Destination Connection ID field of subsequent
        //# packets that it sends.
        self.setup_initial_crypto(header.source_cid);
        self.rewind_first_flight();
    }

    /// Forgets the packets of the first flight so the handshake restarts
    /// cleanly after Version Negotiation or Retry.
    fn rewind_first_flight(&mut self) {
        let space = &mut self.spaces[Epoch::Initial as usize];
        let packets: Vec<_> = core::mem::take(&mut space.sent_packets)
            .into_values()
            .collect();
        space.ack_eliciting_in_flight = 0;
        space.loss_time = None;
        space.last_ack_eliciting_time = None;
        for packet in packets {
            if packet.in_flight {
                self.recovery.cc.on_packet_discarded(packet.sent_bytes);
            }
            for intent in packet.delivery_handlers.iter().cloned() {
                self.fire_delivery_handler(intent, false);
            }
        }
    }

    /// Decrypts and applies one protected packet. Returns true when a fatal
    /// condition was handled.
    #[allow(clippy::too_many_arguments)]
    fn process_protected_packet(
        &mut self,
        header: &Header,
        datagram: &[u8],
        packet_start: usize,
        end: usize,
        epoch: Epoch,
        addr: SocketAddr,
        now: Timestamp,
    ) -> bool {
        let e = epoch as usize;
        if self.spaces[e].discarded {
            self.trace.on_packet_dropped("packet for discarded space");
            return false;
        }
        let Some(crypto) = self.cryptos[e].as_ref() else {
            self.trace.on_packet_dropped("no keys for epoch");
            return false;
        };

        let expected = self.spaces[e].expected_packet_number;
        let packet_bytes = &datagram[packet_start..end];
        let plain = match crypto.decrypt_packet(
            packet_bytes,
            header.pn_offset - packet_start,
            expected,
        ) {
            Ok(plain) => plain,
            Err(_) => {
                self.trace.on_packet_dropped("decryption failed");
                return false;
            }
        };

        if plain.key_update_detected {
            //= https://www.rfc-editor.org/rfc/rfc9001#section-6.2
            //# If a packet is successfully processed with the next key and IV,
            //# then the peer has initiated a key update.
            if let Some(crypto) = self.cryptos[e].as_mut() {
                crypto.update_key();
                self.trace.on_key_update(crypto.key_phase());
            }
            self.key_update_pending_ack = Some(self.packet_number);
        }

        let first_in_space = self.spaces[e].largest_received_packet.is_none();
        if !self.spaces[e].on_packet_received(plain.packet_number) {
            // duplicate delivery; the AEAD nonce already vouched for it once
            self.trace.on_packet_dropped("duplicate packet number");
            return false;
        }

        // learn the peer's handshake connection ID
        if epoch == Epoch::Initial {
            if self.is_client {
                if first_in_space {
                    if let Some(slot) = self.peer_cids.first_mut() {
                        slot.cid = header.source_cid;
                    }
                }
            } else if self.peer_cids.is_empty() {
                self.peer_cids.push(CidSlot {
                    sequence: 0,
                    cid: header.source_cid,
                    stateless_reset_token: None,
                    retired: false,
                });
            }
        }

        //= https://www.rfc-editor.org/rfc/rfc9001#section-4.9.1
        //# a server MUST discard Initial keys when it first successfully
        //# processes a Handshake packet
        if epoch == Epoch::Handshake {
            self.address_validated = true;
            self.discard_space(Epoch::Initial);
        }

        let is_largest = self.spaces[e]
            .largest_received_packet
            .map_or(true, |largest| plain.packet_number >= largest);
        if is_largest {
            self.spaces[e].largest_received_packet = Some(plain.packet_number);
            self.spaces[e].largest_received_time = Some(now);

            //= https://www.rfc-editor.org/rfc/rfc9000#section-17.4
            //# the client ... sets the spin bit to the inverse of the spin
            //# bit in the most recent packet with the highest packet number
            //# received from the server; the server sets it to the same value
            if epoch == Epoch::OneRtt {
                let peer_spin = spin_bit(plain.header[0]);
                self.spin_bit = if self.is_client { !peer_spin } else { peer_spin };
            }
        }

        // detect a path change on a connected server
        if self.state == State::Connected && !self.is_client {
            if let Some(current) = self.remote_addr {
                if current != addr && self.path_challenge_sent.is_none() {
                    let mut challenge = [0u8; 8];
                    self.rng.public_random_fill(&mut challenge);
                    self.path_challenge_pending = Some(challenge);
                    self.remote_addr = Some(addr);
                }
            }
        }

        let mut payload = Buffer::from_slice(&plain.payload);
        let mut is_ack_eliciting = false;
        while !payload.is_at_end() {
            let frame = match Frame::decode(&mut payload) {
                Ok(frame) => frame,
                Err(error) => {
                    self.on_transport_error(error, now);
                    return true;
                }
            };
            let frame_type = frame.type_id();

            //= https://www.rfc-editor.org/rfc/rfc9000#section-12.4
            //# An endpoint MUST treat receipt of a frame in a packet type
            //# that is not permitted as a connection error of type
            //# PROTOCOL_VIOLATION.
            if !frame_allowed_in_epoch(frame_type, epoch) {
                self.on_transport_error(
                    TransportError::PROTOCOL_VIOLATION
                        .with_frame_type(frame_type)
                        .with_reason("frame type not permitted in this epoch"),
                    now,
                );
                return true;
            }
            if frame::is_ack_eliciting(frame_type) {
                is_ack_eliciting = true;
            }

            if let Err(error) = self.handle_frame(frame, epoch, &header.destination_cid, now) {
                self.on_transport_error(error, now);
                return true;
            }
            if !self.is_live() {
                return true;
            }
        }

        if is_ack_eliciting {
            self.idle_deadline = Some(now + self.idle_timeout);
            let deadline = now + self.ack_send_delay(epoch);
            let space = &mut self.spaces[e];
            if space.ack_at.map_or(true, |current| deadline < current) {
                space.ack_at = Some(deadline);
            }
        }

        self.trace.on_packet_received(epoch, plain.packet_number);
        false
    }

    fn handle_frame(
        &mut self,
        frame: Frame,
        epoch: Epoch,
        packet_dcid: &ConnectionId,
        now: Timestamp,
    ) -> Result<(), TransportError> {
        let e = epoch as usize;
        match frame {
            Frame::Padding { .. } | Frame::Ping => {}

            Frame::Ack {
                ack_delay,
                ranges,
                ecn_counts: _,
                ..
            } => {
                let delay = self.incoming_ack_delay(ack_delay, epoch);
                let outcome = self.recovery.on_ack_received(
                    &mut self.spaces[e],
                    &ranges,
                    delay,
                    self.handshake_confirmed,
                    now,
                );
                let largest = ranges.last().map(|r| *r.end());
                for packet in outcome.newly_acked {
                    for intent in packet.delivery_handlers.iter().cloned() {
                        self.fire_delivery_handler(intent, true);
                    }
                }
                self.on_packets_lost(outcome.lost);

                if epoch == Epoch::OneRtt {
                    if let (Some(pending), Some(largest)) =
                        (self.key_update_pending_ack, largest)
                    {
                        if largest >= pending {
                            // the new phase is confirmed; the old receive
                            // key can go
                            if let Some(crypto) = self.cryptos[e].as_mut() {
                                crypto.discard_previous_key();
                            }
                            self.key_update_pending_ack = None;
                        }
                    }
                }
            }

            Frame::Crypto { offset, data } => {
                let delivered = self.crypto_streams[e]
                    .receiver
                    .handle_frame(offset, &data, false)
                    .map_err(|error| {
                        if error.code == TransportError::FLOW_CONTROL_ERROR.code {
                            //= https://www.rfc-editor.org/rfc/rfc9000#section-7.5
                            //# If an endpoint does not expand its buffer, it MUST close
                            //# the connection with a CRYPTO_BUFFER_EXCEEDED error code.
                            TransportError::CRYPTO_BUFFER_EXCEEDED
                                .with_frame_type(type_id::CRYPTO)
                        } else {
                            error.with_frame_type(type_id::CRYPTO)
                        }
                    })?;
                if let Some(delivered) = delivered {
                    let output = self
                        .tls
                        .handle_crypto(epoch, &delivered.data)
                        .map_err(|error| {
                            TransportError::crypto_error(error.alert).with_reason(error.reason)
                        })?;
                    self.process_tls_output(output)?;
                }
            }

            Frame::NewToken { token } => {
                //= https://www.rfc-editor.org/rfc/rfc9000#section-19.7
                //# A server MUST treat receipt of a NEW_TOKEN frame as a
                //# connection error of type PROTOCOL_VIOLATION.
                if !self.is_client {
                    return Err(TransportError::PROTOCOL_VIOLATION
                        .with_frame_type(type_id::NEW_TOKEN)
                        .with_reason("client sent NEW_TOKEN"));
                }
                self.received_token = Some(token);
            }

            Frame::Stream {
                stream_id,
                offset,
                data,
                fin,
            } => {
                self.on_stream_frame(stream_id, offset, &data, fin)?;
            }

            Frame::MaxData { maximum } => {
                if maximum > self.peer_max_data {
                    self.peer_max_data = maximum;
                    self.data_blocked_sent_at = None;
                }
            }

            Frame::MaxStreamData { stream_id, maximum } => {
                if let Some(sender) = self
                    .streams
                    .get_mut(&stream_id)
                    .and_then(|s| s.sender.as_mut())
                {
                    sender.set_max_stream_data(maximum);
                }
            }

            Frame::MaxStreams {
                bidirectional,
                maximum,
            } => {
                if bidirectional {
                    if maximum > self.peer_max_streams_bidi {
                        self.peer_max_streams_bidi = maximum;
                        self.streams_blocked_sent_bidi = None;
                    }
                } else if maximum > self.peer_max_streams_uni {
                    self.peer_max_streams_uni = maximum;
                    self.streams_blocked_sent_uni = None;
                }
            }

            Frame::DataBlocked { .. }
            | Frame::StreamDataBlocked { .. }
            | Frame::StreamsBlocked { .. } => {
                // informational; our advertisements are driven by delivery
            }

            Frame::ResetStream {
                stream_id,
                error_code,
                final_size,
            } => {
                self.on_reset_stream_frame(stream_id, error_code, final_size)?;
            }

            Frame::StopSending {
                stream_id,
                error_code,
            } => {
                self.on_stop_sending_frame(stream_id, error_code)?;
            }

            Frame::NewConnectionId {
                sequence,
                retire_prior_to,
                connection_id,
                stateless_reset_token,
            } => {
                self.on_new_connection_id(
                    sequence,
                    retire_prior_to,
                    connection_id,
                    stateless_reset_token,
                )?;
            }

            Frame::RetireConnectionId { sequence } => {
                //= https://www.rfc-editor.org/rfc/rfc9000#section-19.16
                //# Receipt of a RETIRE_CONNECTION_ID frame containing a
                //# sequence number greater than any previously sent to the
                //# peer MUST be treated as a connection error of type
                //# PROTOCOL_VIOLATION.
                if sequence >= self.host_cid_seq {
                    return Err(TransportError::PROTOCOL_VIOLATION
                        .with_frame_type(type_id::RETIRE_CONNECTION_ID)
                        .with_reason("retired connection id was never issued"));
                }
                let retired_cid = self
                    .host_cids
                    .iter()
                    .find(|slot| slot.sequence == sequence)
                    .map(|slot| slot.cid);
                if let Some(cid) = retired_cid {
                    //= https://www.rfc-editor.org/rfc/rfc9000#section-19.16
                    //# The sequence number specified in a RETIRE_CONNECTION_ID
                    //# frame MUST NOT refer to the Destination Connection ID
                    //# field of the packet in which the frame is contained.
                    if cid == *packet_dcid {
                        return Err(TransportError::PROTOCOL_VIOLATION
                            .with_frame_type(type_id::RETIRE_CONNECTION_ID)
                            .with_reason("retired the connection id in use"));
                    }
                    let slot = self
                        .host_cids
                        .iter_mut()
                        .find(|slot| slot.sequence == sequence)
                        .expect("found above");
                    if !slot.retired {
                        slot.retired = true;
                        self.events.push_back(Event::ConnectionIdRetired {
                            connection_id: bytes::Bytes::copy_from_slice(cid.as_ref()),
                        });
                        self.issue_host_cid();
                    }
                }
            }

            Frame::PathChallenge { data } => {
                //= https://www.rfc-editor.org/rfc/rfc9000#section-8.2.2
                //# On receiving a PATH_CHALLENGE frame, an endpoint MUST
                //# respond by echoing the data contained in the
                //# PATH_CHALLENGE frame in a PATH_RESPONSE frame.
                self.path_response_pending = Some(data);
            }

            Frame::PathResponse { data } => {
                if let Some((challenge, _)) = self.path_challenge_sent {
                    if bool::from(challenge.ct_eq(&data)) {
                        self.path_challenge_sent = None;
                    }
                }
            }

            Frame::ConnectionClose {
                error_code,
                frame_type,
                reason,
            } => {
                let reason = String::from_utf8_lossy(&reason).into_owned();
                self.emit_terminated(error_code, frame_type, &reason);
                //= https://www.rfc-editor.org/rfc/rfc9000#section-10.2.2
                //# An endpoint that receives a CONNECTION_CLOSE frame enters
                //# the draining state
                self.state = State::Draining;
                self.arm_close_deadline(now);
            }

            Frame::HandshakeDone => {
                //= https://www.rfc-editor.org/rfc/rfc9000#section-19.20
                //# A server MUST treat receipt of a HANDSHAKE_DONE frame as a
                //# connection error of type PROTOCOL_VIOLATION.
                if !self.is_client {
                    return Err(TransportError::PROTOCOL_VIOLATION
                        .with_frame_type(type_id::HANDSHAKE_DONE)
                        .with_reason("server received HANDSHAKE_DONE"));
                }
                self.handshake_confirmed = true;
                self.on_handshake_confirmed_maybe();
                self.discard_space(Epoch::Handshake);
            }

            Frame::Datagram { data } => {
                let limit = self.config.max_datagram_frame_size.unwrap_or(0);
                //= https://www.rfc-editor.org/rfc/rfc9221#section-3
                //# An endpoint that receives a DATAGRAM frame when it has not
                //# indicated support MUST terminate the connection with an
                //# error of type PROTOCOL_VIOLATION.
                if limit == 0 {
                    return Err(TransportError::PROTOCOL_VIOLATION
                        .with_frame_type(type_id::DATAGRAM)
                        .with_reason("DATAGRAM frames are not negotiated"));
                }
                if data.len() as u64 > limit {
                    return Err(TransportError::PROTOCOL_VIOLATION
                        .with_frame_type(type_id::DATAGRAM)
                        .with_reason("oversized DATAGRAM frame"));
                }
                self.events.push_back(Event::DatagramFrameReceived { data });
            }
        }
        Ok(())
    }

    /// Admits a remote reference to `stream_id`, creating the stream when
    /// the peer legitimately opens it. Returns false when the stream lived
    /// and died already and the frame should be ignored.
    fn admit_remote_stream(
        &mut self,
        stream_id: u64,
        frame_type: u64,
    ) -> Result<bool, TransportError> {
        if self.streams.contains_key(&stream_id) {
            return Ok(true);
        }

        let local_initiated = is_client_initiated(stream_id) == self.is_client;
        let uni = is_unidirectional(stream_id);
        let ordinal = stream_ordinal(stream_id);

        if local_initiated {
            let opened = if uni {
                self.local_streams_opened_uni
            } else {
                self.local_streams_opened_bidi
            };
            if ordinal < opened {
                // closed and garbage-collected; stale retransmission
                return Ok(false);
            }
            //= https://www.rfc-editor.org/rfc/rfc9000#section-19.8
            //# An endpoint MUST terminate the connection with error
            //# STREAM_STATE_ERROR if it receives a STREAM frame for a
            //# locally initiated stream that has not yet been created
            return Err(TransportError::STREAM_STATE_ERROR
                .with_frame_type(frame_type)
                .with_reason("frame for a stream we never opened"));
        }

        let (limit, opened) = if uni {
            (self.local_max_streams_uni, self.remote_streams_opened_uni)
        } else {
            (self.local_max_streams_bidi, self.remote_streams_opened_bidi)
        };
        if ordinal < opened {
            return Ok(false);
        }
        //= https://www.rfc-editor.org/rfc/rfc9000#section-4.6
        //# An endpoint that receives a frame with a stream ID exceeding the
        //# limit it has sent MUST treat this as a connection error of type
        //# STREAM_LIMIT_ERROR
        if ordinal >= limit {
            return Err(TransportError::STREAM_LIMIT_ERROR
                .with_frame_type(frame_type)
                .with_reason("peer exceeded the stream limit"));
        }

        let sender = if uni {
            None
        } else {
            Some(SendStream::new(
                self.peer_initial_stream_credit(stream_id, true),
            ))
        };
        let receiver = Some(RecvStream::new(self.local_initial_stream_credit(stream_id)));
        self.streams
            .insert(stream_id, Stream::new(stream_id, sender, receiver));
        if uni {
            self.remote_streams_opened_uni = ordinal + 1;
        } else {
            self.remote_streams_opened_bidi = ordinal + 1;
        }
        self.update_streams_credit(uni);
        Ok(true)
    }

    fn on_stream_frame(
        &mut self,
        stream_id: u64,
        offset: u64,
        data: &[u8],
        fin: bool,
    ) -> Result<(), TransportError> {
        if !self.admit_remote_stream(stream_id, type_id::STREAM_BASE)? {
            return Ok(());
        }

        let stream = self.streams.get_mut(&stream_id).expect("admitted");
        let Some(receiver) = stream.receiver.as_mut() else {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-19.8
            //# An endpoint MUST terminate the connection with error
            //# STREAM_STATE_ERROR if it receives a STREAM frame for a ...
            //# send-only stream.
            return Err(TransportError::STREAM_STATE_ERROR
                .with_frame_type(type_id::STREAM_BASE)
                .with_reason("STREAM frame on a send-only stream"));
        };

        let before = receiver.highest_offset();
        let delivered = receiver
            .handle_frame(offset, data, fin)
            .map_err(|error| error.with_frame_type(type_id::STREAM_BASE))?;
        let delta = receiver.highest_offset() - before;

        self.data_received += delta;
        //= https://www.rfc-editor.org/rfc/rfc9000#section-4.1
        //# A receiver MUST close the connection with an error of type
        //# FLOW_CONTROL_ERROR if the sender violates the advertised
        //# connection or stream data limits
        if self.data_received > self.local_max_data {
            return Err(TransportError::FLOW_CONTROL_ERROR
                .with_frame_type(type_id::STREAM_BASE)
                .with_reason("connection data limit exceeded"));
        }

        if let Some(delivered) = delivered {
            self.events.push_back(Event::StreamDataReceived {
                stream_id,
                data: delivered.data,
                end_stream: delivered.fin,
            });
        }
        self.update_connection_credit();
        self.drop_stream_if_finished(stream_id);
        Ok(())
    }

    fn on_reset_stream_frame(
        &mut self,
        stream_id: u64,
        error_code: u64,
        final_size: u64,
    ) -> Result<(), TransportError> {
        if !self.admit_remote_stream(stream_id, type_id::RESET_STREAM)? {
            return Ok(());
        }
        let stream = self.streams.get_mut(&stream_id).expect("admitted");
        let Some(receiver) = stream.receiver.as_mut() else {
            return Err(TransportError::STREAM_STATE_ERROR
                .with_frame_type(type_id::RESET_STREAM)
                .with_reason("RESET_STREAM on a send-only stream"));
        };

        let before = receiver.highest_offset();
        let newly_reset = receiver
            .handle_reset(final_size)
            .map_err(|error| error.with_frame_type(type_id::RESET_STREAM))?;
        let delta = receiver.highest_offset() - before;
        self.data_received += delta;
        if self.data_received > self.local_max_data {
            return Err(TransportError::FLOW_CONTROL_ERROR
                .with_frame_type(type_id::RESET_STREAM)
                .with_reason("connection data limit exceeded"));
        }

        if newly_reset {
            self.events.push_back(Event::StreamReset {
                stream_id,
                error_code,
            });
        }
        self.drop_stream_if_finished(stream_id);
        Ok(())
    }

    fn on_stop_sending_frame(
        &mut self,
        stream_id: u64,
        error_code: u64,
    ) -> Result<(), TransportError> {
        if !self.admit_remote_stream(stream_id, type_id::STOP_SENDING)? {
            return Ok(());
        }
        let stream = self.streams.get_mut(&stream_id).expect("admitted");
        let Some(sender) = stream.sender.as_mut() else {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-19.5
            //# An endpoint that receives a STOP_SENDING frame for a
            //# receive-only stream MUST terminate the connection with error
            //# STREAM_STATE_ERROR.
            return Err(TransportError::STREAM_STATE_ERROR
                .with_frame_type(type_id::STOP_SENDING)
                .with_reason("STOP_SENDING on a receive-only stream"));
        };
        sender.on_stop_sending(error_code);
        self.events.push_back(Event::StopSendingReceived {
            stream_id,
            error_code,
        });
        Ok(())
    }

    fn on_new_connection_id(
        &mut self,
        sequence: u64,
        retire_prior_to: u64,
        connection_id: ConnectionId,
        stateless_reset_token: [u8; 16],
    ) -> Result<(), TransportError> {
        if self.peer_cids.iter().any(|slot| slot.sequence == sequence) {
            return Ok(());
        }

        self.peer_reset_tokens.push(stateless_reset_token);
        self.peer_cids.push(CidSlot {
            sequence,
            cid: connection_id,
            stateless_reset_token: Some(stateless_reset_token),
            retired: sequence < self.peer_retire_prior_to,
        });

        if retire_prior_to > self.peer_retire_prior_to {
            self.peer_retire_prior_to = retire_prior_to;
            let to_retire: Vec<u64> = self
                .peer_cids
                .iter()
                .filter(|slot| !slot.retired && slot.sequence < retire_prior_to)
                .map(|slot| slot.sequence)
                .collect();
            for seq in to_retire {
                self.retire_peer_cid(seq);
            }
            if self.peer_cid_active_seq < retire_prior_to {
                let next = self
                    .peer_cids
                    .iter()
                    .filter(|slot| !slot.retired)
                    .map(|slot| slot.sequence)
                    .min();
                if let Some(next) = next {
                    self.peer_cid_active_seq = next;
                }
            }
        }

        //= https://www.rfc-editor.org/rfc/rfc9000#section-5.1.1
        //# After processing a NEW_CONNECTION_ID frame and adding and
        //# retiring active connection IDs, if the number of active
        //# connection IDs exceeds the value advertised in its
        //# active_connection_id_limit transport parameter, an endpoint MUST
        //# close the connection with an error of type
        //# CONNECTION_ID_LIMIT_ERROR.
        let active = self.peer_cids.iter().filter(|slot| !slot.retired).count() as u64;
        if active > super::LOCAL_ACTIVE_CID_LIMIT {
            return Err(TransportError::CONNECTION_ID_LIMIT_ERROR
                .with_frame_type(type_id::NEW_CONNECTION_ID)
                .with_reason("too many active connection ids"));
        }
        Ok(())
    }
}
