// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Outbound datagram assembly: each send pass walks the epochs, writes
//! pending frames through the packet builder and registers the resulting
//! packets with recovery.

use super::{Connection, State};
use crate::{
    builder::{BuilderConfig, BuilderStop, DeliveryIntent, PacketBuilder},
    crypto::{CryptoPair, Epoch},
    frame::{self, type_id},
    packet::PacketType,
    time::Timestamp,
    transport::error::TransportError,
};
use bytes::Bytes;
use skein_codec::size_varint;

impl Connection {
    /// Drains everything ready to go onto the wire and reports the next
    /// timer deadline.
    pub fn datagrams_to_send(&mut self, now: Timestamp) -> (Vec<Vec<u8>>, Option<Timestamp>) {
        let mut datagrams = Vec::new();
        if let Some(vn) = self.pending_vn_response.take() {
            datagrams.push(vn);
        }

        if matches!(self.state, State::Terminated | State::Draining) {
            return (datagrams, self.get_timer());
        }

        // the builder borrows the crypto material for the duration of this
        // pass; the connection gets it back before returning
        let pass_cryptos: [Option<CryptoPair>; Epoch::COUNT] = [
            self.cryptos[0].take(),
            self.cryptos[1].take(),
            self.cryptos[2].take(),
        ];

        let builder_config = BuilderConfig {
            host_cid: self.host_cid(),
            peer_cid: self.active_peer_cid(),
            version: self.version,
            is_client: self.is_client,
            packet_number: self.packet_number,
            peer_token: if self.is_client {
                self.peer_token.clone()
            } else {
                Bytes::new()
            },
            spin_bit: self.spin_bit && self.spin_enabled,
        };
        let mut builder = PacketBuilder::new(builder_config, self.max_udp_payload);

        if self.state == State::Closing {
            if self.close_pending {
                let _ = self.write_close(&mut builder, &pass_cryptos, now);
            }
        } else {
            //= https://www.rfc-editor.org/rfc/rfc9002#section-7
            //# An endpoint MUST NOT send a packet if it would cause
            //# bytes_in_flight ... to be larger than the congestion window
            if self.probe_pending.iter().any(|&p| p) {
                // PTO probes may be sent even when congestion limited
                builder.max_flight_bytes = None;
            } else {
                builder.max_flight_bytes = Some(self.recovery.cc.available_window());
            }
            //= https://www.rfc-editor.org/rfc/rfc9000#section-8.1
            //# an endpoint MUST limit the amount of data it sends to the
            //# unvalidated address to three times the amount of data received
            //# from that address
            if !self.is_client && !self.address_validated {
                builder.max_total_bytes =
                    Some((3 * self.bytes_received_total).saturating_sub(self.bytes_sent_total));
            }
            let _ = self.write_all(&mut builder, &pass_cryptos, now);
        }

        let (built, packets) = builder.flush();
        self.packet_number = builder.packet_number();
        drop(builder);
        self.cryptos = pass_cryptos;

        for packet in packets {
            self.trace
                .on_packet_sent(packet.epoch, packet.packet_number, packet.sent_bytes);
            let epoch = packet.epoch as usize;
            self.recovery
                .on_packet_sent(&mut self.spaces[epoch], packet, now);
        }
        self.trace.on_recovery_metrics(
            self.recovery.cc.bytes_in_flight(),
            self.recovery.cc.congestion_window(),
            self.recovery.rtt.smoothed_rtt(),
        );

        for datagram in &built {
            self.bytes_sent_total += datagram.len();
        }
        datagrams.extend(built);
        (datagrams, self.get_timer())
    }

    fn write_all<'a>(
        &mut self,
        builder: &mut PacketBuilder<'a>,
        cryptos: &'a [Option<CryptoPair>; Epoch::COUNT],
        now: Timestamp,
    ) -> Result<(), BuilderStop> {
        for epoch in Epoch::iter() {
            let e = epoch as usize;
            if self.spaces[e].discarded {
                continue;
            }
            let Some(crypto) = cryptos[e].as_ref() else {
                continue;
            };
            let packet_type = match epoch {
                Epoch::Initial => PacketType::Initial,
                Epoch::Handshake => PacketType::Handshake,
                Epoch::OneRtt => PacketType::OneRtt,
            };

            let has_crypto = self.crypto_streams[e].sender.has_pending_data();
            let probe = self.probe_pending[e];
            let app = epoch == Epoch::OneRtt && self.handshake_complete;
            let app_pending = app && self.has_application_data();
            //= https://www.rfc-editor.org/rfc/rfc9000#section-13.2.1
            //# an ACK frame SHOULD be generated ... when the ack timer
            //# expires, or when a packet is sent for another reason
            let ack_due = self.spaces[e]
                .ack_at
                .map_or(false, |deadline| deadline.has_elapsed(now));
            let send_ack = !self.spaces[e].ack_queue.is_empty()
                && (ack_due || has_crypto || probe || app_pending);
            if !(send_ack || has_crypto || probe || app_pending) {
                continue;
            }

            builder.start_packet(packet_type, crypto)?;
            if send_ack {
                self.write_ack_frame(builder, epoch, now)?;
            }
            self.write_crypto_frames(builder, epoch)?;
            if app {
                self.write_application_frames(builder, now)?;
            }
            if self.probe_pending[e] {
                //= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.4
                //# When there is no data to send, the sender SHOULD send a
                //# PING or other ack-eliciting frame in a single packet
                builder.start_frame(type_id::PING, 1, None)?;
                self.probe_pending[e] = false;
            }

            // keep opening packets in this epoch until the data or the
            // byte budget runs out
            loop {
                let more = self.crypto_streams[e].sender.has_pending_data()
                    || (app && self.has_application_data());
                if !more || builder.packet_is_empty() {
                    break;
                }
                builder.start_packet(packet_type, crypto)?;
                self.write_crypto_frames(builder, epoch)?;
                if app {
                    self.write_application_frames(builder, now)?;
                }
                if builder.packet_is_empty() {
                    break;
                }
            }
        }
        Ok(())
    }

    fn write_close<'a>(
        &mut self,
        builder: &mut PacketBuilder<'a>,
        cryptos: &'a [Option<CryptoPair>; Epoch::COUNT],
        now: Timestamp,
    ) -> Result<(), BuilderStop> {
        let Some(info) = self.close_info.clone() else {
            return Ok(());
        };

        //= https://www.rfc-editor.org/rfc/rfc9000#section-10.2.3
        //# A client will always know whether the server has Handshake keys
        //# ... it MUST send a CONNECTION_CLOSE frame in a Handshake packet.
        let (epoch, packet_type) = if cryptos[Epoch::OneRtt as usize].is_some() {
            (Epoch::OneRtt, PacketType::OneRtt)
        } else if cryptos[Epoch::Handshake as usize].is_some() {
            (Epoch::Handshake, PacketType::Handshake)
        } else if cryptos[Epoch::Initial as usize].is_some() {
            (Epoch::Initial, PacketType::Initial)
        } else {
            return Ok(());
        };
        let crypto = cryptos[epoch as usize].as_ref().expect("chosen above");

        builder.start_packet(packet_type, crypto)?;

        //= https://www.rfc-editor.org/rfc/rfc9000#section-10.2.3
        //# A CONNECTION_CLOSE of type 0x1d MUST be replaced by a
        //# CONNECTION_CLOSE of type 0x1c when sending the frame in Initial
        //# or Handshake packets.  Otherwise, information about the
        //# application state might be revealed.
        let as_application = info.is_application && epoch == Epoch::OneRtt;
        let (frame_type_id, error_code, reason) = if as_application {
            (type_id::APPLICATION_CLOSE, info.error_code, info.reason)
        } else if info.is_application {
            (
                type_id::TRANSPORT_CLOSE,
                TransportError::APPLICATION_ERROR.code,
                String::new(),
            )
        } else {
            (type_id::TRANSPORT_CLOSE, info.error_code, info.reason)
        };
        let reason = reason.as_bytes();
        let reason = &reason[..reason.len().min(512)];
        let capacity = 1 + 8 + 8 + size_varint(reason.len() as u64) + reason.len();

        let buf = builder.start_frame(frame_type_id, capacity, None)?;
        buf.put_var(error_code)?;
        if frame_type_id == type_id::TRANSPORT_CLOSE {
            buf.put_var(info.frame_type.unwrap_or(0))?;
        }
        buf.put_var_bytes(reason)?;

        self.close_pending = false;
        self.close_last_sent = Some(now);
        if self.close_deadline.is_none() {
            self.arm_close_deadline(now);
        }
        Ok(())
    }

    fn write_ack_frame(
        &mut self,
        builder: &mut PacketBuilder<'_>,
        epoch: Epoch,
        now: Timestamp,
    ) -> Result<(), BuilderStop> {
        let e = epoch as usize;
        let mut ranges: Vec<_> = self.spaces[e].ack_queue.iter().collect();
        if ranges.is_empty() {
            return Ok(());
        }

        // bound the frame; old ranges are dropped first
        let budget = builder.remaining_buffer_space();
        let max_ranges = budget.saturating_sub(32) / 16;
        if ranges.len() > max_ranges.max(1) {
            let skip = ranges.len() - max_ranges.max(1);
            ranges.drain(..skip);
        }

        let largest = *ranges.last().expect("non-empty").end();
        let delay = Self::outgoing_ack_delay(&self.spaces[e], now);
        let capacity = 1 + 8 + 8 + 8 + ranges.len() * 16;

        let buf = builder.start_frame(
            type_id::ACK,
            capacity,
            Some(DeliveryIntent::Ack {
                epoch,
                largest_acked: largest,
            }),
        )?;
        frame::encode_ack_body(buf, largest, delay, &ranges)?;
        self.spaces[e].ack_at = None;
        Ok(())
    }

    fn write_crypto_frames(
        &mut self,
        builder: &mut PacketBuilder<'_>,
        epoch: Epoch,
    ) -> Result<(), BuilderStop> {
        let e = epoch as usize;
        while self.crypto_streams[e].sender.has_pending_data() {
            // type + worst-case offset varint + 2-byte length
            let overhead = 1 + 8 + 2;
            let avail = builder
                .remaining_flight_space()
                .min(builder.remaining_buffer_space());
            if avail <= overhead {
                return Err(BuilderStop);
            }

            let Some(pending) = self.crypto_streams[e]
                .sender
                .next_frame(avail - overhead, u64::MAX)
            else {
                break;
            };
            let start = pending.offset;
            let end = start + pending.data.len() as u64;
            let capacity = 1
                + size_varint(start)
                + size_varint(pending.data.len() as u64)
                + pending.data.len();

            match builder.start_frame(
                type_id::CRYPTO,
                capacity,
                Some(DeliveryIntent::Crypto { epoch, start, end }),
            ) {
                Ok(buf) => {
                    buf.put_var(start)?;
                    buf.put_var_bytes(&pending.data)?;
                }
                Err(stop) => {
                    // hand the range back; it was only reserved
                    self.crypto_streams[e]
                        .sender
                        .on_data_delivery(false, start, end, false);
                    return Err(stop);
                }
            }
        }
        Ok(())
    }

    fn write_application_frames(
        &mut self,
        builder: &mut PacketBuilder<'_>,
        now: Timestamp,
    ) -> Result<(), BuilderStop> {
        if self.handshake_done_pending {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-19.20
            //# The server MUST NOT send a HANDSHAKE_DONE frame ... before
            //# completing the handshake.
            builder.start_frame(
                type_id::HANDSHAKE_DONE,
                1,
                Some(DeliveryIntent::HandshakeDone),
            )?;
            self.handshake_done_pending = false;
        }

        while let Some(token) = self.new_token_pending.first().cloned() {
            let capacity = 1 + size_varint(token.len() as u64) + token.len();
            let buf = builder.start_frame(
                type_id::NEW_TOKEN,
                capacity,
                Some(DeliveryIntent::NewToken {
                    token: token.clone(),
                }),
            )?;
            buf.put_var_bytes(&token)?;
            self.new_token_pending.remove(0);
        }

        while let Some(&uid) = self.ping_pending.first() {
            builder.start_frame(type_id::PING, 1, Some(DeliveryIntent::Ping { uid }))?;
            self.ping_pending.remove(0);
        }

        if let Some(data) = self.path_response_pending {
            let buf = builder.start_frame(type_id::PATH_RESPONSE, 9, None)?;
            buf.put_bytes(&data)?;
            self.path_response_pending = None;
        }

        if let Some(data) = self.path_challenge_pending {
            let buf = builder.start_frame(type_id::PATH_CHALLENGE, 9, None)?;
            buf.put_bytes(&data)?;
            self.path_challenge_pending = None;
            let window = self.recovery.rtt.pto_period(true) * super::PATH_VALIDATION_PTO_FACTOR;
            self.path_challenge_sent = Some((data, now + window));
        }

        if self.local_max_data_pending {
            let buf = builder.start_frame(type_id::MAX_DATA, 9, Some(DeliveryIntent::MaxData))?;
            buf.put_var(self.local_max_data)?;
            self.local_max_data_pending = false;
        }

        let credit_updates: Vec<u64> = self
            .streams
            .iter()
            .filter(|(_, stream)| {
                stream
                    .receiver
                    .as_ref()
                    .map_or(false, |r| r.credit_update_needed())
            })
            .map(|(&id, _)| id)
            .collect();
        for stream_id in credit_updates {
            let Some(maximum) = self
                .streams
                .get(&stream_id)
                .and_then(|s| s.receiver.as_ref())
                .filter(|r| r.credit_update_needed())
                .map(|r| r.max_stream_data_local())
            else {
                continue;
            };
            let buf = builder.start_frame(
                type_id::MAX_STREAM_DATA,
                17,
                Some(DeliveryIntent::MaxStreamData { stream_id }),
            )?;
            buf.put_var(stream_id)?;
            buf.put_var(maximum)?;
            if let Some(receiver) = self
                .streams
                .get_mut(&stream_id)
                .and_then(|s| s.receiver.as_mut())
            {
                let _ = receiver.take_credit_update();
            }
        }

        if self.max_streams_bidi_pending {
            let buf = builder.start_frame(
                type_id::MAX_STREAMS_BIDI,
                9,
                Some(DeliveryIntent::MaxStreams {
                    bidirectional: true,
                }),
            )?;
            buf.put_var(self.local_max_streams_bidi)?;
            self.max_streams_bidi_pending = false;
        }
        if self.max_streams_uni_pending {
            let buf = builder.start_frame(
                type_id::MAX_STREAMS_UNI,
                9,
                Some(DeliveryIntent::MaxStreams {
                    bidirectional: false,
                }),
            )?;
            buf.put_var(self.local_max_streams_uni)?;
            self.max_streams_uni_pending = false;
        }

        while let Some(&sequence) = self.new_cid_pending.first() {
            let Some(slot) = self
                .host_cids
                .iter()
                .find(|slot| slot.sequence == sequence)
                .map(|slot| (slot.cid, slot.stateless_reset_token))
            else {
                self.new_cid_pending.remove(0);
                continue;
            };
            let (cid, token) = slot;
            let buf = builder.start_frame(
                type_id::NEW_CONNECTION_ID,
                48,
                Some(DeliveryIntent::NewConnectionId { sequence }),
            )?;
            buf.put_var(sequence)?;
            buf.put_var(0)?; // retire prior to
            buf.put_u8(cid.len() as u8)?;
            buf.put_bytes(cid.as_ref())?;
            buf.put_bytes(&token.unwrap_or([0; 16]))?;
            self.new_cid_pending.remove(0);
        }

        while let Some(&sequence) = self.retire_pending.first() {
            let buf = builder.start_frame(
                type_id::RETIRE_CONNECTION_ID,
                9,
                Some(DeliveryIntent::RetireConnectionId { sequence }),
            )?;
            buf.put_var(sequence)?;
            self.retire_pending.remove(0);
        }

        let reset_ids: Vec<u64> = self
            .streams
            .iter()
            .filter(|(_, stream)| {
                stream
                    .sender
                    .as_ref()
                    .map_or(false, |s| s.has_pending_reset())
            })
            .map(|(&id, _)| id)
            .collect();
        for stream_id in reset_ids {
            let Some((error_code, final_size)) = self
                .streams
                .get(&stream_id)
                .and_then(|s| s.sender.as_ref())
                .and_then(|s| s.pending_reset())
            else {
                continue;
            };
            let buf = builder.start_frame(
                type_id::RESET_STREAM,
                25,
                Some(DeliveryIntent::ResetStream { stream_id }),
            )?;
            buf.put_var(stream_id)?;
            buf.put_var(error_code)?;
            buf.put_var(final_size)?;
            if let Some(sender) = self
                .streams
                .get_mut(&stream_id)
                .and_then(|s| s.sender.as_mut())
            {
                let _ = sender.take_pending_reset();
            }
        }

        while let Some(&(stream_id, error_code)) = self.stop_sending_pending.first() {
            let buf = builder.start_frame(
                type_id::STOP_SENDING,
                17,
                Some(DeliveryIntent::StopSending {
                    stream_id,
                    error_code,
                }),
            )?;
            buf.put_var(stream_id)?;
            buf.put_var(error_code)?;
            self.stop_sending_pending.remove(0);
        }

        //= https://www.rfc-editor.org/rfc/rfc9000#section-19.12
        //# A sender SHOULD send a DATA_BLOCKED frame ... when it wishes to
        //# send data but is unable to do so due to connection-level flow
        //# control
        if self.peer_params.is_some()
            && self.data_sent >= self.peer_max_data
            && self.streams.values().any(|s| {
                s.sender
                    .as_ref()
                    .map_or(false, |sender| sender.has_pending_data())
            })
            && self.data_blocked_sent_at != Some(self.peer_max_data)
        {
            let buf = builder.start_frame(type_id::DATA_BLOCKED, 9, None)?;
            buf.put_var(self.peer_max_data)?;
            self.data_blocked_sent_at = Some(self.peer_max_data);
        }

        if let Some(limit) = self.streams_blocked_sent_bidi.take() {
            let buf = builder.start_frame(type_id::STREAMS_BLOCKED_BIDI, 9, None)?;
            buf.put_var(limit)?;
        }
        if let Some(limit) = self.streams_blocked_sent_uni.take() {
            let buf = builder.start_frame(type_id::STREAMS_BLOCKED_UNI, 9, None)?;
            buf.put_var(limit)?;
        }

        let blocked_streams: Vec<(u64, u64)> = {
            let mut blocked = Vec::new();
            for (&id, stream) in self.streams.iter_mut() {
                if let Some(sender) = stream.sender.as_mut() {
                    if let Some(limit) = sender.should_send_blocked() {
                        blocked.push((id, limit));
                    }
                }
            }
            blocked
        };
        for (stream_id, limit) in blocked_streams {
            let buf = builder.start_frame(type_id::STREAM_DATA_BLOCKED, 17, None)?;
            buf.put_var(stream_id)?;
            buf.put_var(limit)?;
        }

        //= https://www.rfc-editor.org/rfc/rfc9221#section-5
        //# DATAGRAM frames cannot be fragmented; lost ones are not
        //# retransmitted.
        while let Some(data) = self.datagram_queue.front() {
            let capacity = 1 + size_varint(data.len() as u64) + data.len();
            let buf = builder.start_frame(type_id::DATAGRAM_WITH_LENGTH, capacity, None)?;
            let data = self.datagram_queue.pop_front().expect("peeked");
            buf.put_var_bytes(&data)?;
        }

        self.write_stream_frames(builder)
    }

    fn write_stream_frames(&mut self, builder: &mut PacketBuilder<'_>) -> Result<(), BuilderStop> {
        let mut ids: Vec<u64> = self
            .streams
            .iter()
            .filter(|(_, stream)| {
                stream
                    .sender
                    .as_ref()
                    .map_or(false, |s| s.has_pending_data())
            })
            .map(|(&id, _)| id)
            .collect();
        ids.sort_unstable();

        for stream_id in ids {
            loop {
                let overhead = 1 + size_varint(stream_id) + 8 + 2;
                let avail = builder
                    .remaining_flight_space()
                    .min(builder.remaining_buffer_space());
                if avail <= overhead {
                    return Err(BuilderStop);
                }

                let allowance = self.peer_max_data.saturating_sub(self.data_sent);
                let Some(pending) = self
                    .streams
                    .get_mut(&stream_id)
                    .and_then(|s| s.sender.as_mut())
                    .and_then(|s| s.next_frame(avail - overhead, allowance))
                else {
                    break;
                };

                let start = pending.offset;
                let end = start + pending.data.len() as u64;
                let frame_type = type_id::STREAM_BASE
                    | 0x04
                    | 0x02
                    | if pending.fin { 0x01 } else { 0x00 };
                let capacity = 1
                    + size_varint(stream_id)
                    + size_varint(start)
                    + size_varint(pending.data.len() as u64)
                    + pending.data.len();

                match builder.start_frame(
                    frame_type,
                    capacity,
                    Some(DeliveryIntent::Stream {
                        stream_id,
                        start,
                        end,
                        fin: pending.fin,
                    }),
                ) {
                    Ok(buf) => {
                        buf.put_var(stream_id)?;
                        buf.put_var(start)?;
                        buf.put_var_bytes(&pending.data)?;
                        self.data_sent += pending.new_bytes;
                    }
                    Err(stop) => {
                        // give the range back before ending the pass
                        if let Some(sender) = self
                            .streams
                            .get_mut(&stream_id)
                            .and_then(|s| s.sender.as_mut())
                        {
                            sender.on_data_delivery(false, start, end, pending.fin);
                        }
                        return Err(stop);
                    }
                }
            }
        }
        Ok(())
    }
}
