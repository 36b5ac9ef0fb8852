// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The per-connection state machine.
//!
//! A [`Connection`] is sans-I/O: the embedder feeds it received datagrams,
//! drains datagrams to send, fires expired timers and issues application
//! calls. All four entry points mutate the connection and return; nothing
//! runs in the background and nothing blocks. The embedder serializes them
//! on one thread or behind one lock.

mod recv;
mod send;

use crate::{
    builder::DeliveryIntent,
    cid::{CidSlot, ConnectionId, StatelessResetToken},
    config::{Configuration, PACKET_MAX_SIZE, QUIC_VERSION_1},
    crypto::{CryptoPair, Epoch},
    event::Event,
    random,
    recovery::{PacketSpace, Recovery},
    stream::{
        is_client_initiated, is_unidirectional, stream_ordinal, RecvStream, SendStream, Stream,
        StreamError,
    },
    time::Timestamp,
    tls,
    trace::{NoopTraceHandler, TraceHandler},
    transport::{error::TransportError, parameters::TransportParameters},
};
use bytes::Bytes;
use core::time::Duration;
use hashbrown::HashMap;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

/// Datagram payload budget before the path is known to carry more.
pub const INITIAL_DATAGRAM_SIZE: usize = 1280;

/// Out-of-order CRYPTO data buffered per epoch before the connection fails
/// with CRYPTO_BUFFER_EXCEEDED.
const CRYPTO_BUFFER_LIMIT: u64 = 512 * 1024;

/// The connection-level receive window stops doubling here.
const MAX_DATA_WINDOW_CAP: u64 = 64 * 1024 * 1024;

/// Advertised stream-count windows stop doubling here.
const MAX_STREAMS_WINDOW_CAP: u64 = 1 << 16;

/// Local ack delay exponent; the default, so it is not advertised.
const LOCAL_ACK_DELAY_EXPONENT: u64 = 3;

/// Local max_ack_delay, advertised and used to pace 1-RTT acknowledgments.
const LOCAL_MAX_ACK_DELAY: Duration = Duration::from_millis(25);

/// How many connection IDs we keep issued to the peer.
const LOCAL_ACTIVE_CID_LIMIT: u64 = 8;

/// Outstanding PATH_CHALLENGEs expire after three PTOs.
const PATH_VALIDATION_PTO_FACTOR: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    FirstFlight,
    Connected,
    Closing,
    Draining,
    Terminated,
}

#[derive(Clone, Debug)]
pub(crate) struct CloseInfo {
    pub error_code: u64,
    pub frame_type: Option<u64>,
    pub reason: String,
    pub is_application: bool,
}

/// The CRYPTO stream of one epoch: an outbound retransmittable buffer and
/// an inbound reassembler, reusing the stream halves.
pub(crate) struct CryptoStream {
    pub sender: SendStream,
    pub receiver: RecvStream,
}

impl Default for CryptoStream {
    fn default() -> Self {
        Self {
            sender: SendStream::new(u64::MAX),
            receiver: RecvStream::new(CRYPTO_BUFFER_LIMIT),
        }
    }
}

pub struct Connection {
    pub(crate) config: Configuration,
    pub(crate) is_client: bool,
    pub(crate) version: u32,
    pub(crate) state: State,

    pub(crate) tls: Box<dyn tls::Session>,
    pub(crate) rng: Box<dyn random::Generator>,
    pub(crate) trace: Arc<dyn TraceHandler>,

    pub(crate) cryptos: [Option<CryptoPair>; Epoch::COUNT],
    pub(crate) crypto_streams: [CryptoStream; Epoch::COUNT],
    pub(crate) spaces: [PacketSpace; Epoch::COUNT],
    pub(crate) recovery: Recovery,
    pub(crate) packet_number: u64,

    // connection IDs we issued, indexed by sequence
    pub(crate) host_cids: Vec<CidSlot>,
    pub(crate) host_cid_seq: u64,
    pub(crate) new_cid_pending: Vec<u64>,
    // connection IDs the peer gave us
    pub(crate) peer_cids: Vec<CidSlot>,
    pub(crate) peer_cid_active_seq: u64,
    pub(crate) peer_retire_prior_to: u64,
    pub(crate) retire_pending: Vec<u64>,

    pub(crate) original_destination_cid: ConnectionId,
    pub(crate) retry_source_cid: Option<ConnectionId>,
    pub(crate) retry_accepted: bool,
    pub(crate) peer_token: Bytes,
    pub(crate) received_token: Option<Bytes>,
    /// Server: tokens minted by the embedder, awaiting a NEW_TOKEN frame.
    pub(crate) new_token_pending: Vec<Bytes>,
    pub(crate) session_ticket: Option<Bytes>,

    pub(crate) peer_params: Option<TransportParameters>,
    pub(crate) peer_reset_tokens: Vec<StatelessResetToken>,

    pub(crate) handshake_complete: bool,
    pub(crate) handshake_confirmed: bool,
    pub(crate) handshake_done_pending: bool,
    /// First 1-RTT packet number sent under a fresh key phase; the retained
    /// previous key is dropped once it is acknowledged.
    pub(crate) key_update_pending_ack: Option<u64>,

    pub(crate) streams: HashMap<u64, Stream>,
    pub(crate) local_max_data: u64,
    pub(crate) local_max_data_window: u64,
    pub(crate) local_max_data_pending: bool,
    pub(crate) data_received: u64,
    pub(crate) peer_max_data: u64,
    pub(crate) data_sent: u64,
    pub(crate) data_blocked_sent_at: Option<u64>,

    pub(crate) local_max_streams_bidi: u64,
    pub(crate) local_streams_window_bidi: u64,
    pub(crate) max_streams_bidi_pending: bool,
    pub(crate) local_max_streams_uni: u64,
    pub(crate) local_streams_window_uni: u64,
    pub(crate) max_streams_uni_pending: bool,
    pub(crate) peer_max_streams_bidi: u64,
    pub(crate) peer_max_streams_uni: u64,
    pub(crate) streams_blocked_sent_bidi: Option<u64>,
    pub(crate) streams_blocked_sent_uni: Option<u64>,
    pub(crate) local_streams_opened_bidi: u64,
    pub(crate) local_streams_opened_uni: u64,
    pub(crate) remote_streams_opened_bidi: u64,
    pub(crate) remote_streams_opened_uni: u64,
    pub(crate) stop_sending_pending: Vec<(u64, u64)>,

    pub(crate) events: VecDeque<Event>,
    pub(crate) terminated_event_sent: bool,
    pub(crate) close_info: Option<CloseInfo>,
    pub(crate) close_pending: bool,
    pub(crate) close_deadline: Option<Timestamp>,
    pub(crate) close_last_sent: Option<Timestamp>,

    pub(crate) ping_pending: Vec<u64>,
    pub(crate) ping_uid_next: u64,
    pub(crate) probe_pending: [bool; Epoch::COUNT],
    pub(crate) datagram_queue: VecDeque<Bytes>,

    pub(crate) path_challenge_sent: Option<([u8; 8], Timestamp)>,
    pub(crate) path_challenge_pending: Option<[u8; 8]>,
    pub(crate) path_response_pending: Option<[u8; 8]>,
    pub(crate) remote_addr: Option<SocketAddr>,

    pub(crate) spin_bit: bool,
    pub(crate) spin_enabled: bool,

    pub(crate) idle_timeout: Duration,
    pub(crate) idle_deadline: Option<Timestamp>,

    pub(crate) address_validated: bool,
    pub(crate) bytes_received_total: usize,
    pub(crate) bytes_sent_total: usize,

    pub(crate) max_udp_payload: usize,
    pub(crate) pending_vn_response: Option<Vec<u8>>,
}

impl Connection {
    /// Creates a client connection and queues its first flight.
    pub fn new_client(
        config: Configuration,
        tls: Box<dyn tls::Session>,
        mut rng: Box<dyn random::Generator>,
        remote_addr: SocketAddr,
        now: Timestamp,
    ) -> Result<Self, TransportError> {
        debug_assert!(config.is_client);

        let mut odcid_bytes = [0u8; 8];
        rng.public_random_fill(&mut odcid_bytes);
        let original_destination_cid =
            ConnectionId::try_from_slice(&odcid_bytes).expect("8 byte connection id");

        let version = config
            .original_version
            .or_else(|| config.supported_versions.first().copied())
            .unwrap_or(QUIC_VERSION_1);

        let mut connection = Self::new_common(config, tls, rng, version, true);
        connection.remote_addr = Some(remote_addr);
        connection.original_destination_cid = original_destination_cid;
        // until the server's SCID is known, its first connection ID is the
        // randomly chosen original destination
        connection.peer_cids.push(CidSlot {
            sequence: 0,
            cid: original_destination_cid,
            stateless_reset_token: None,
            retired: false,
        });

        connection.setup_initial_crypto(original_destination_cid);
        let local_params = connection.build_transport_parameters();
        connection.tls.set_transport_parameters(&local_params);
        let output = connection.tls.start().map_err(|e| {
            TransportError::crypto_error(e.alert).with_reason("handshake start failed")
        })?;
        connection.process_tls_output(output)?;
        connection.idle_deadline = Some(now + connection.idle_timeout);
        Ok(connection)
    }

    /// Creates a server connection for a client whose first INITIAL carried
    /// `original_destination_cid`.
    ///
    /// When the embedder performed a Retry, it passes the source connection
    /// ID it used in the Retry packet; a validated token also marks the
    /// client address as verified for amplification purposes.
    pub fn new_server(
        config: Configuration,
        tls: Box<dyn tls::Session>,
        rng: Box<dyn random::Generator>,
        original_destination_cid: ConnectionId,
        retry_source_cid: Option<ConnectionId>,
        remote_addr: SocketAddr,
        now: Timestamp,
    ) -> Self {
        debug_assert!(!config.is_client);
        let version = config
            .supported_versions
            .first()
            .copied()
            .unwrap_or(QUIC_VERSION_1);

        let mut connection = Self::new_common(config, tls, rng, version, false);
        connection.remote_addr = Some(remote_addr);
        connection.original_destination_cid = original_destination_cid;
        connection.retry_source_cid = retry_source_cid;
        connection.address_validated = retry_source_cid.is_some();

        //= https://www.rfc-editor.org/rfc/rfc9001#section-5.2
        //# The secret used for Initial packets changes when a server sends
        //# a Retry packet ... using the Destination Connection ID field
        //# from the second Initial packet.
        connection.setup_initial_crypto(retry_source_cid.unwrap_or(original_destination_cid));
        let local_params = connection.build_transport_parameters();
        connection.tls.set_transport_parameters(&local_params);
        connection.idle_deadline = Some(now + connection.idle_timeout);
        connection
    }

    fn new_common(
        config: Configuration,
        tls: Box<dyn tls::Session>,
        mut rng: Box<dyn random::Generator>,
        version: u32,
        is_client: bool,
    ) -> Self {
        let mut host_cid_bytes = vec![0u8; config.connection_id_length];
        rng.public_random_fill(&mut host_cid_bytes);
        let host_cid = ConnectionId::try_from_slice(&host_cid_bytes)
            .expect("configured connection id length is valid");
        let mut reset_token = [0u8; 16];
        rng.private_random_fill(&mut reset_token);

        let mut spin_byte = [0u8; 1];
        rng.public_random_fill(&mut spin_byte);

        let trace: Arc<dyn TraceHandler> = config
            .quic_logger
            .clone()
            .unwrap_or_else(|| Arc::new(NoopTraceHandler));

        let max_datagram_size = config.max_datagram_size.min(PACKET_MAX_SIZE);
        let idle_timeout = config.idle_timeout;

        Self {
            is_client,
            version,
            state: State::FirstFlight,
            rng,
            trace,
            cryptos: [None, None, None],
            crypto_streams: Default::default(),
            spaces: Default::default(),
            recovery: Recovery::new(max_datagram_size),
            packet_number: 0,
            host_cids: vec![CidSlot {
                sequence: 0,
                cid: host_cid,
                stateless_reset_token: Some(reset_token),
                retired: false,
            }],
            host_cid_seq: 1,
            new_cid_pending: Vec::new(),
            peer_cids: Vec::new(),
            peer_cid_active_seq: 0,
            peer_retire_prior_to: 0,
            retire_pending: Vec::new(),
            original_destination_cid: ConnectionId::EMPTY,
            retry_source_cid: None,
            retry_accepted: false,
            peer_token: config.token.clone(),
            received_token: None,
            new_token_pending: Vec::new(),
            session_ticket: None,
            peer_params: None,
            peer_reset_tokens: Vec::new(),
            handshake_complete: false,
            handshake_confirmed: false,
            handshake_done_pending: false,
            key_update_pending_ack: None,
            streams: HashMap::new(),
            local_max_data: config.initial_max_data,
            local_max_data_window: config.initial_max_data,
            local_max_data_pending: false,
            data_received: 0,
            peer_max_data: 0,
            data_sent: 0,
            data_blocked_sent_at: None,
            local_max_streams_bidi: config.initial_max_streams_bidi,
            local_streams_window_bidi: config.initial_max_streams_bidi.max(1),
            max_streams_bidi_pending: false,
            local_max_streams_uni: config.initial_max_streams_uni,
            local_streams_window_uni: config.initial_max_streams_uni.max(1),
            max_streams_uni_pending: false,
            peer_max_streams_bidi: 0,
            peer_max_streams_uni: 0,
            streams_blocked_sent_bidi: None,
            streams_blocked_sent_uni: None,
            local_streams_opened_bidi: 0,
            local_streams_opened_uni: 0,
            remote_streams_opened_bidi: 0,
            remote_streams_opened_uni: 0,
            stop_sending_pending: Vec::new(),
            events: VecDeque::new(),
            terminated_event_sent: false,
            close_info: None,
            close_pending: false,
            close_deadline: None,
            close_last_sent: None,
            ping_pending: Vec::new(),
            ping_uid_next: 0,
            probe_pending: [false; Epoch::COUNT],
            datagram_queue: VecDeque::new(),
            path_challenge_sent: None,
            path_challenge_pending: None,
            path_response_pending: None,
            remote_addr: None,
            spin_bit: false,
            //= https://www.rfc-editor.org/rfc/rfc9000#section-17.4
            //# endpoints MUST disable their use of the spin bit for a
            //# randomly selected fraction of connections
            spin_enabled: spin_byte[0] % 8 != 0,
            idle_timeout,
            idle_deadline: None,
            address_validated: is_client,
            bytes_received_total: 0,
            bytes_sent_total: 0,
            max_udp_payload: INITIAL_DATAGRAM_SIZE,
            pending_vn_response: None,
            config,
            tls,
        }
    }

    // === accessors ===

    pub fn configuration(&self) -> &Configuration {
        &self.config
    }

    /// The TLS collaborator driving the handshake.
    pub fn tls(&self) -> &dyn tls::Session {
        &*self.tls
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_handshake_complete(&self) -> bool {
        self.handshake_complete
    }

    /// The QUIC version in use, after any version negotiation.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// The connection ID the peer currently addresses us with.
    pub fn host_cid(&self) -> ConnectionId {
        self.host_cids
            .iter()
            .find(|slot| !slot.retired)
            .map(|slot| slot.cid)
            .unwrap_or(ConnectionId::EMPTY)
    }

    /// All non-retired connection IDs we have issued; the embedder routes
    /// inbound datagrams by these.
    pub fn host_cids(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.host_cids
            .iter()
            .filter(|slot| !slot.retired)
            .map(|slot| slot.cid)
    }

    /// The session ticket received from the server, if any.
    pub fn tls_session_ticket(&self) -> Option<&Bytes> {
        self.session_ticket.as_ref()
    }

    /// The NEW_TOKEN token received from the server, if any.
    pub fn address_validation_token(&self) -> Option<&Bytes> {
        self.received_token.as_ref()
    }

    pub fn next_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// The earliest armed timer deadline.
    pub fn get_timer(&self) -> Option<Timestamp> {
        let mut deadline: Option<Timestamp> = None;
        let mut consider = |candidate: Option<Timestamp>| {
            if let Some(candidate) = candidate {
                if deadline.map_or(true, |current| candidate < current) {
                    deadline = Some(candidate);
                }
            }
        };

        match self.state {
            State::Terminated => return None,
            State::Closing | State::Draining => {
                consider(self.close_deadline);
                return deadline;
            }
            _ => {}
        }

        consider(self.idle_deadline);
        for space in &self.spaces {
            if space.discarded {
                continue;
            }
            consider(space.ack_at);
            consider(space.loss_time);
        }
        let spaces = [&self.spaces[0], &self.spaces[1], &self.spaces[2]];
        consider(self.recovery.pto_deadline(&spaces));
        if let Some((_, expiry)) = self.path_challenge_sent {
            consider(Some(expiry));
        }
        deadline
    }

    // === application calls ===

    /// Queues stream data for delivery to the peer.
    pub fn send_stream_data(
        &mut self,
        stream_id: u64,
        data: &[u8],
        fin: bool,
    ) -> Result<(), StreamError> {
        if !self.is_live() {
            return Err(StreamError::NotWritable);
        }
        self.ensure_local_stream(stream_id)?;
        let stream = self.streams.get_mut(&stream_id).expect("just ensured");
        let sender = stream.sender.as_mut().ok_or(StreamError::NotWritable)?;
        sender.write(data, fin)
    }

    /// Abruptly terminates our sending direction of a stream.
    pub fn reset_stream(&mut self, stream_id: u64, error_code: u64) -> Result<(), StreamError> {
        let stream = self
            .streams
            .get_mut(&stream_id)
            .ok_or(StreamError::UnknownStream)?;
        let sender = stream.sender.as_mut().ok_or(StreamError::NotWritable)?;
        sender.reset(error_code)
    }

    /// Asks the peer to stop sending on a stream.
    pub fn stop_sending(&mut self, stream_id: u64, error_code: u64) -> Result<(), StreamError> {
        let stream = self
            .streams
            .get_mut(&stream_id)
            .ok_or(StreamError::UnknownStream)?;
        if stream.receiver.is_none() {
            return Err(StreamError::NotReadable);
        }
        self.stop_sending_pending.push((stream_id, error_code));
        Ok(())
    }

    /// Queues an unreliable DATAGRAM frame.
    pub fn send_datagram_frame(&mut self, data: Bytes) -> Result<(), TransportError> {
        let peer_limit = self
            .peer_params
            .as_ref()
            .and_then(|p| p.max_datagram_frame_size)
            .unwrap_or(0);
        if self.config.max_datagram_frame_size.unwrap_or(0) == 0 || peer_limit == 0 {
            return Err(TransportError::PROTOCOL_VIOLATION
                .with_reason("DATAGRAM frames are not negotiated"));
        }
        // type byte + 2-byte length prefix
        if data.len() as u64 + 3 > peer_limit {
            return Err(TransportError::PROTOCOL_VIOLATION
                .with_reason("datagram larger than the peer accepts"));
        }
        self.datagram_queue.push_back(data);
        Ok(())
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#section-19.7
    //# A server sends a NEW_TOKEN frame to provide the client with a token
    //# to send in the header of an Initial packet for a future connection.
    /// Queues a NEW_TOKEN frame carrying an address-validation token for
    /// the client to replay on a future connection. The token itself is
    /// minted and later verified by the embedder's token interface.
    pub fn send_new_token(&mut self, token: Bytes) -> Result<(), TransportError> {
        if self.is_client {
            return Err(TransportError::PROTOCOL_VIOLATION
                .with_reason("only servers send NEW_TOKEN"));
        }
        if token.is_empty() {
            return Err(TransportError::FRAME_ENCODING_ERROR
                .with_reason("empty NEW_TOKEN token"));
        }
        self.new_token_pending.push(token);
        Ok(())
    }

    /// Queues a PING; the returned uid appears in `PingAcknowledged`.
    pub fn ping(&mut self) -> u64 {
        let uid = self.ping_uid_next;
        self.ping_uid_next += 1;
        self.ping_pending.push(uid);
        uid
    }

    /// Requests a 1-RTT key rotation.
    pub fn request_key_update(&mut self) {
        if self.cryptos[Epoch::OneRtt as usize].is_some() && self.handshake_confirmed {
            if let Some(crypto) = self.cryptos[Epoch::OneRtt as usize].as_mut() {
                crypto.update_key();
                self.trace.on_key_update(crypto.key_phase());
                self.key_update_pending_ack = Some(self.packet_number);
            }
        }
    }

    /// Switches outbound packets to the next connection ID issued by the
    /// peer and retires the current one.
    pub fn change_connection_id(&mut self) {
        let current = self.peer_cid_active_seq;
        let next = self
            .peer_cids
            .iter()
            .filter(|slot| !slot.retired && slot.sequence > current)
            .min_by_key(|slot| slot.sequence)
            .map(|slot| slot.sequence);
        if let Some(next) = next {
            self.peer_cid_active_seq = next;
            self.retire_peer_cid(current);
        }
    }

    /// Closes the connection. `frame_type` is `None` for an application
    /// close.
    pub fn close(&mut self, error_code: u64, frame_type: Option<u64>, reason: &str) {
        if !self.is_live() {
            return;
        }
        self.enter_closing(
            CloseInfo {
                error_code,
                frame_type,
                reason: reason.to_string(),
                is_application: frame_type.is_none(),
            },
            None,
        );
    }

    // === timers ===

    /// Fires every timer whose deadline has passed.
    pub fn handle_timer(&mut self, now: Timestamp) {
        match self.state {
            State::Terminated => return,
            State::Closing | State::Draining => {
                if self
                    .close_deadline
                    .map_or(false, |deadline| deadline.has_elapsed(now))
                {
                    self.state = State::Terminated;
                }
                return;
            }
            _ => {}
        }

        //= https://www.rfc-editor.org/rfc/rfc9000#section-10.1
        //# If a max_idle_timeout is specified by either endpoint ... the
        //# connection is silently closed and its state is discarded when it
        //# remains idle
        if self
            .idle_deadline
            .map_or(false, |deadline| deadline.has_elapsed(now))
        {
            self.emit_terminated(0, None, "Idle timeout");
            self.state = State::Terminated;
            return;
        }

        // path validation window
        if let Some((_, expiry)) = self.path_challenge_sent {
            if expiry.has_elapsed(now) {
                self.path_challenge_sent = None;
            }
        }

        // loss detection
        for index in 0..Epoch::COUNT {
            let expired = self.spaces[index]
                .loss_time
                .map_or(false, |t| t.has_elapsed(now));
            if expired {
                let lost = {
                    let space = &mut self.spaces[index];
                    self.recovery.detect_loss(space, now)
                };
                self.on_packets_lost(lost);
            }
        }

        // probe timeout
        let spaces = [&self.spaces[0], &self.spaces[1], &self.spaces[2]];
        if let Some(deadline) = self.recovery.pto_deadline(&spaces) {
            if deadline.has_elapsed(now) {
                self.recovery.pto_count += 1;
                //= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.4
                //# When a PTO timer expires, a sender MUST send at least one
                //# ack-eliciting packet in the packet number space as a probe.
                if let Some(epoch) = Epoch::iter().find(|&epoch| {
                    !self.spaces[epoch as usize].discarded
                        && self.spaces[epoch as usize].ack_eliciting_in_flight > 0
                }) {
                    self.probe_pending[epoch as usize] = true;
                }
            }
        }
    }

    // === shared internals ===

    pub(crate) fn is_live(&self) -> bool {
        matches!(self.state, State::FirstFlight | State::Connected)
    }

    pub(crate) fn setup_initial_crypto(&mut self, dcid: ConnectionId) {
        let keys = self
            .tls
            .initial_keys(self.version, dcid.as_ref(), self.is_client);
        self.cryptos[Epoch::Initial as usize] = Some(CryptoPair::new(keys));
    }

    pub(crate) fn emit_terminated(
        &mut self,
        error_code: u64,
        frame_type: Option<u64>,
        reason: &str,
    ) {
        if self.terminated_event_sent {
            return;
        }
        self.terminated_event_sent = true;
        self.trace.on_connection_closed(error_code, reason);
        self.events.push_back(Event::ConnectionTerminated {
            error_code,
            frame_type,
            reason_phrase: reason.to_string(),
        });
    }

    /// Enters CLOSING and schedules the CONNECTION_CLOSE frame.
    pub(crate) fn enter_closing(&mut self, info: CloseInfo, now: Option<Timestamp>) {
        if !matches!(self.state, State::FirstFlight | State::Connected) {
            return;
        }
        self.emit_terminated(info.error_code, info.frame_type, &info.reason);
        self.close_info = Some(info);
        self.close_pending = true;
        self.state = State::Closing;
        if let Some(now) = now {
            self.arm_close_deadline(now);
        }
    }

    pub(crate) fn arm_close_deadline(&mut self, now: Timestamp) {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-10.2
        //# The closing and draining connection states exist to ensure that
        //# connections close cleanly ... for at least three times the
        //# current PTO interval
        let pto = self.recovery.rtt.pto_period(true);
        self.close_deadline = Some(now + pto * 3);
    }

    /// Handles a fatal transport error discovered while processing input.
    pub(crate) fn on_transport_error(&mut self, error: TransportError, now: Timestamp) {
        let info = CloseInfo {
            error_code: error.code,
            frame_type: error.frame_type,
            reason: error.reason.to_string(),
            is_application: false,
        };
        self.enter_closing(info, Some(now));
    }

    /// Fires the delivery handlers of packets declared lost.
    pub(crate) fn on_packets_lost(&mut self, lost: Vec<crate::builder::SentPacket>) {
        for packet in lost {
            let numbers = [packet.packet_number];
            self.trace.on_packets_lost(packet.epoch, &numbers);
            for intent in packet.delivery_handlers.iter().cloned() {
                self.fire_delivery_handler(intent, false);
            }
        }
    }

    /// Fires one delivery descriptor with ACKED (`acked == true`) or LOST.
    pub(crate) fn fire_delivery_handler(&mut self, intent: DeliveryIntent, acked: bool) {
        match intent {
            DeliveryIntent::Ack {
                epoch,
                largest_acked,
            } => {
                if acked {
                    // stop re-acknowledging anything the peer has seen us ack
                    self.spaces[epoch as usize]
                        .ack_queue
                        .remove_below(largest_acked + 1);
                }
            }
            DeliveryIntent::Crypto { epoch, start, end } => {
                self.crypto_streams[epoch as usize]
                    .sender
                    .on_data_delivery(acked, start, end, false);
            }
            DeliveryIntent::Stream {
                stream_id,
                start,
                end,
                fin,
            } => {
                if let Some(sender) = self
                    .streams
                    .get_mut(&stream_id)
                    .and_then(|s| s.sender.as_mut())
                {
                    sender.on_data_delivery(acked, start, end, fin);
                }
                self.drop_stream_if_finished(stream_id);
            }
            DeliveryIntent::MaxData => {
                if !acked {
                    self.local_max_data_pending = true;
                }
            }
            DeliveryIntent::MaxStreamData { stream_id } => {
                if !acked {
                    if let Some(receiver) = self
                        .streams
                        .get_mut(&stream_id)
                        .and_then(|s| s.receiver.as_mut())
                    {
                        receiver.on_credit_update_lost();
                    }
                }
            }
            DeliveryIntent::MaxStreams { bidirectional } => {
                if !acked {
                    if bidirectional {
                        self.max_streams_bidi_pending = true;
                    } else {
                        self.max_streams_uni_pending = true;
                    }
                }
            }
            DeliveryIntent::Ping { uid } => {
                if acked {
                    self.events.push_back(Event::PingAcknowledged { uid });
                } else {
                    self.ping_pending.push(uid);
                }
            }
            DeliveryIntent::ResetStream { stream_id } => {
                if let Some(sender) = self
                    .streams
                    .get_mut(&stream_id)
                    .and_then(|s| s.sender.as_mut())
                {
                    sender.on_reset_delivery(acked);
                }
                self.drop_stream_if_finished(stream_id);
            }
            DeliveryIntent::StopSending {
                stream_id,
                error_code,
            } => {
                if !acked {
                    self.stop_sending_pending.push((stream_id, error_code));
                }
            }
            DeliveryIntent::NewConnectionId { sequence } => {
                if !acked && !self.new_cid_pending.contains(&sequence) {
                    self.new_cid_pending.push(sequence);
                }
            }
            DeliveryIntent::RetireConnectionId { sequence } => {
                if !acked && !self.retire_pending.contains(&sequence) {
                    self.retire_pending.push(sequence);
                }
            }
            DeliveryIntent::NewToken { token } => {
                if !acked {
                    self.new_token_pending.push(token);
                }
            }
            DeliveryIntent::HandshakeDone => {
                if acked {
                    // the client confirmed; handshake keys are done for
                    self.discard_space(Epoch::Handshake);
                } else {
                    self.handshake_done_pending = true;
                }
            }
        }
    }

    pub(crate) fn discard_space(&mut self, epoch: Epoch) {
        if self.spaces[epoch as usize].discarded {
            return;
        }
        let space = &mut self.spaces[epoch as usize];
        self.recovery.on_space_discarded(space);
        self.cryptos[epoch as usize] = None;
    }

    pub(crate) fn drop_stream_if_finished(&mut self, stream_id: u64) {
        if self
            .streams
            .get(&stream_id)
            .map_or(false, Stream::is_finished)
        {
            self.streams.remove(&stream_id);
        }
    }

    pub(crate) fn retire_peer_cid(&mut self, sequence: u64) {
        if let Some(slot) = self
            .peer_cids
            .iter_mut()
            .find(|slot| slot.sequence == sequence)
        {
            if !slot.retired {
                slot.retired = true;
                if !self.retire_pending.contains(&sequence) {
                    self.retire_pending.push(sequence);
                }
            }
        }
    }

    /// The active destination connection ID for outbound packets.
    pub(crate) fn active_peer_cid(&self) -> ConnectionId {
        self.peer_cids
            .iter()
            .find(|slot| slot.sequence == self.peer_cid_active_seq)
            .map(|slot| slot.cid)
            .unwrap_or(ConnectionId::EMPTY)
    }

    /// Ensures a locally initiated stream exists, checking the peer's
    /// stream limit.
    fn ensure_local_stream(&mut self, stream_id: u64) -> Result<(), StreamError> {
        if self.streams.contains_key(&stream_id) {
            return Ok(());
        }
        let local_initiated = is_client_initiated(stream_id) == self.is_client;
        if !local_initiated {
            return Err(StreamError::UnknownStream);
        }
        let uni = is_unidirectional(stream_id);
        let ordinal = stream_ordinal(stream_id);
        let (limit, opened, blocked_sent) = if uni {
            (
                self.peer_max_streams_uni,
                &mut self.local_streams_opened_uni,
                &mut self.streams_blocked_sent_uni,
            )
        } else {
            (
                self.peer_max_streams_bidi,
                &mut self.local_streams_opened_bidi,
                &mut self.streams_blocked_sent_bidi,
            )
        };
        // before the peer's transport parameters arrive its stream limits
        // are unknown; creation proceeds and data waits for credit
        if self.peer_params.is_some() && ordinal >= limit {
            if *blocked_sent != Some(limit) {
                *blocked_sent = Some(limit);
            }
            return Err(StreamError::LimitExceeded);
        }
        if ordinal + 1 > *opened {
            *opened = ordinal + 1;
        }

        let send_credit = self.peer_initial_stream_credit(stream_id, true);
        let recv_credit = self.local_initial_stream_credit(stream_id);
        let sender = Some(SendStream::new(send_credit));
        let receiver = if uni {
            None
        } else {
            Some(RecvStream::new(recv_credit))
        };
        self.streams
            .insert(stream_id, Stream::new(stream_id, sender, receiver));
        Ok(())
    }

    /// Initial send credit granted by the peer's transport parameters for
    /// `stream_id`.
    pub(crate) fn peer_initial_stream_credit(&self, stream_id: u64, _send: bool) -> u64 {
        let Some(params) = &self.peer_params else {
            return 0;
        };
        let local_initiated = is_client_initiated(stream_id) == self.is_client;
        if is_unidirectional(stream_id) {
            params.initial_max_stream_data_uni.unwrap_or(0)
        } else if local_initiated {
            params.initial_max_stream_data_bidi_remote.unwrap_or(0)
        } else {
            params.initial_max_stream_data_bidi_local.unwrap_or(0)
        }
    }

    /// Receive window we advertise for `stream_id`.
    pub(crate) fn local_initial_stream_credit(&self, stream_id: u64) -> u64 {
        let local_initiated = is_client_initiated(stream_id) == self.is_client;
        if is_unidirectional(stream_id) {
            self.config.initial_max_stream_data_uni
        } else if local_initiated {
            self.config.initial_max_stream_data_bidi_local
        } else {
            self.config.initial_max_stream_data_bidi_remote
        }
    }

    /// Serializes our transport parameters for the handshake.
    pub(crate) fn build_transport_parameters(&mut self) -> Vec<u8> {
        let mut params = TransportParameters {
            max_idle_timeout: Some(self.idle_timeout.as_millis() as u64),
            max_udp_payload_size: Some(self.config.max_datagram_size.min(PACKET_MAX_SIZE) as u64),
            initial_max_data: Some(self.config.initial_max_data),
            initial_max_stream_data_bidi_local: Some(self.config.initial_max_stream_data_bidi_local),
            initial_max_stream_data_bidi_remote: Some(
                self.config.initial_max_stream_data_bidi_remote,
            ),
            initial_max_stream_data_uni: Some(self.config.initial_max_stream_data_uni),
            initial_max_streams_bidi: Some(self.config.initial_max_streams_bidi),
            initial_max_streams_uni: Some(self.config.initial_max_streams_uni),
            max_ack_delay: Some(LOCAL_MAX_ACK_DELAY.as_millis() as u64),
            active_connection_id_limit: Some(LOCAL_ACTIVE_CID_LIMIT),
            initial_source_connection_id: Some(self.host_cids[0].cid),
            max_datagram_frame_size: self.config.max_datagram_frame_size.filter(|&v| v > 0),
            ..Default::default()
        };
        if !self.is_client {
            params.original_destination_connection_id = Some(self.original_destination_cid);
            params.retry_source_connection_id = self.retry_source_cid;
            params.stateless_reset_token = self.host_cids[0].stateless_reset_token;
        }
        params.encode()
    }

    /// Validates and installs the peer's transport parameters.
    pub(crate) fn apply_peer_parameters(
        &mut self,
        params: TransportParameters,
    ) -> Result<(), TransportError> {
        if self.is_client {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-7.3
            //# An endpoint MUST treat the absence of the
            //# initial_source_connection_id transport parameter from either
            //# endpoint or the absence of the
            //# original_destination_connection_id transport parameter from
            //# the server as a connection error of type
            //# TRANSPORT_PARAMETER_ERROR.
            if params.original_destination_connection_id
                != Some(self.original_destination_cid)
            {
                return Err(TransportError::TRANSPORT_PARAMETER_ERROR
                    .with_reason("original_destination_connection_id does not match"));
            }
            if self.retry_accepted
                && params.retry_source_connection_id != self.retry_source_cid
            {
                return Err(TransportError::TRANSPORT_PARAMETER_ERROR
                    .with_reason("retry_source_connection_id does not match"));
            }
            if let Some(token) = params.stateless_reset_token {
                self.peer_reset_tokens.push(token);
            }
        }

        self.peer_max_data = params.initial_max_data.unwrap_or(0);
        self.peer_max_streams_bidi = params.initial_max_streams_bidi.unwrap_or(0);
        self.peer_max_streams_uni = params.initial_max_streams_uni.unwrap_or(0);
        self.recovery
            .rtt
            .set_max_ack_delay(Duration::from_millis(params.max_ack_delay_ms()));

        // streams opened before the handshake finished were created with
        // zero credit; raise them to the peer's advertised initial limits
        let bidi_local = params.initial_max_stream_data_bidi_local.unwrap_or(0);
        let bidi_remote = params.initial_max_stream_data_bidi_remote.unwrap_or(0);
        let uni_credit = params.initial_max_stream_data_uni.unwrap_or(0);
        let is_client = self.is_client;
        for (&stream_id, stream) in self.streams.iter_mut() {
            if let Some(sender) = stream.sender.as_mut() {
                let credit = if is_unidirectional(stream_id) {
                    uni_credit
                } else if is_client_initiated(stream_id) == is_client {
                    bidi_remote
                } else {
                    bidi_local
                };
                sender.set_max_stream_data(credit);
            }
        }

        //= https://www.rfc-editor.org/rfc/rfc9000#section-10.1
        //# Each endpoint advertises a max_idle_timeout, but the effective
        //# value at an endpoint is computed as the minimum of the two
        //# advertised values
        if let Some(peer_idle_ms) = params.max_idle_timeout.filter(|&ms| ms > 0) {
            let peer_idle = Duration::from_millis(peer_idle_ms);
            if peer_idle < self.idle_timeout {
                self.idle_timeout = peer_idle;
            }
        }

        self.peer_params = Some(params);
        Ok(())
    }

    /// Applies everything a TLS call produced.
    pub(crate) fn process_tls_output(&mut self, output: tls::Output) -> Result<(), TransportError> {
        for (epoch, data) in output.bursts {
            self.crypto_streams[epoch as usize]
                .sender
                .write(&data, false)
                .map_err(|_| {
                    TransportError::INTERNAL_ERROR.with_reason("crypto stream closed")
                })?;
        }
        if let Some(keys) = output.handshake_keys {
            self.cryptos[Epoch::Handshake as usize] = Some(CryptoPair::new(keys));
        }
        if let Some(keys) = output.one_rtt_keys {
            self.cryptos[Epoch::OneRtt as usize] = Some(CryptoPair::new(keys));
        }
        if let Some(raw) = output.peer_transport_parameters {
            let params = TransportParameters::decode(&raw)?;
            self.apply_peer_parameters(params)?;
        }
        if let Some(outcome) = output.handshake_complete {
            self.on_handshake_complete(outcome);
        }
        if let Some(ticket) = output.session_ticket {
            self.session_ticket = Some(ticket);
        }
        Ok(())
    }

    fn on_handshake_complete(&mut self, outcome: tls::HandshakeOutcome) {
        if self.handshake_complete {
            return;
        }
        self.handshake_complete = true;
        self.state = State::Connected;

        self.events.push_back(Event::ProtocolNegotiated {
            alpn_protocol: outcome.alpn_protocol.clone(),
        });
        self.events.push_back(Event::HandshakeCompleted {
            alpn_protocol: outcome.alpn_protocol,
            early_data_accepted: outcome.early_data_accepted,
            session_resumed: outcome.session_resumed,
        });

        if !self.is_client {
            //= https://www.rfc-editor.org/rfc/rfc9001#section-4.1.2
            //# the TLS handshake is considered confirmed at the server when
            //# the handshake completes
            self.handshake_confirmed = true;
            self.handshake_done_pending = true;
        }
        self.on_handshake_confirmed_maybe();

        // top up the peer's pool of our connection IDs
        let limit = self
            .peer_params
            .as_ref()
            .and_then(|p| p.active_connection_id_limit)
            .unwrap_or(crate::transport::parameters::DEFAULT_ACTIVE_CONNECTION_ID_LIMIT)
            .min(LOCAL_ACTIVE_CID_LIMIT);
        while (self.host_cids.iter().filter(|c| !c.retired).count() as u64) < limit {
            self.issue_host_cid();
        }
    }

    pub(crate) fn on_handshake_confirmed_maybe(&mut self) {
        if !self.handshake_confirmed {
            return;
        }
        // the datagram budget steps up once the path is confirmed
        let peer_cap = self
            .peer_params
            .as_ref()
            .and_then(|p| p.max_udp_payload_size)
            .unwrap_or(PACKET_MAX_SIZE as u64) as usize;
        self.max_udp_payload = self
            .config
            .max_datagram_size
            .min(peer_cap)
            .min(PACKET_MAX_SIZE);
        self.address_validated = true;
    }

    pub(crate) fn issue_host_cid(&mut self) {
        let mut cid_bytes = vec![0u8; self.config.connection_id_length];
        self.rng.public_random_fill(&mut cid_bytes);
        let cid = ConnectionId::try_from_slice(&cid_bytes)
            .expect("configured connection id length is valid");
        let mut token = [0u8; 16];
        self.rng.private_random_fill(&mut token);
        let sequence = self.host_cid_seq;
        self.host_cid_seq += 1;
        self.host_cids.push(CidSlot {
            sequence,
            cid,
            stateless_reset_token: Some(token),
            retired: false,
        });
        self.new_cid_pending.push(sequence);
        self.events.push_back(Event::ConnectionIdIssued {
            connection_id: Bytes::copy_from_slice(cid.as_ref()),
        });
    }

    /// Grows the connection-level receive window once half of it has been
    /// delivered.
    pub(crate) fn update_connection_credit(&mut self) {
        let consumed_into_window = self
            .data_received
            .saturating_sub(self.local_max_data.saturating_sub(self.local_max_data_window));
        if consumed_into_window * 2 > self.local_max_data_window {
            self.local_max_data_window =
                (self.local_max_data_window * 2).min(MAX_DATA_WINDOW_CAP);
            self.local_max_data = self.data_received + self.local_max_data_window;
            self.local_max_data_pending = true;
        }
    }

    /// Grows a stream-count window once half of it has been used.
    pub(crate) fn update_streams_credit(&mut self, unidirectional: bool) {
        let (opened, limit, window, pending) = if unidirectional {
            (
                self.remote_streams_opened_uni,
                &mut self.local_max_streams_uni,
                &mut self.local_streams_window_uni,
                &mut self.max_streams_uni_pending,
            )
        } else {
            (
                self.remote_streams_opened_bidi,
                &mut self.local_max_streams_bidi,
                &mut self.local_streams_window_bidi,
                &mut self.max_streams_bidi_pending,
            )
        };
        let consumed_into_window = opened.saturating_sub(limit.saturating_sub(*window));
        if consumed_into_window * 2 > *window {
            *window = (*window * 2).min(MAX_STREAMS_WINDOW_CAP);
            *limit = opened + *window;
            *pending = true;
        }
    }

    /// True when any application-level frame is waiting for a 1-RTT packet.
    pub(crate) fn has_application_data(&self) -> bool {
        self.handshake_done_pending
            || !self.ping_pending.is_empty()
            || self.path_response_pending.is_some()
            || self.path_challenge_pending.is_some()
            || self.local_max_data_pending
            || self.max_streams_bidi_pending
            || self.max_streams_uni_pending
            || self.streams_blocked_sent_bidi.is_some()
            || self.streams_blocked_sent_uni.is_some()
            || !self.new_cid_pending.is_empty()
            || !self.retire_pending.is_empty()
            || !self.new_token_pending.is_empty()
            || !self.stop_sending_pending.is_empty()
            || !self.datagram_queue.is_empty()
            || self.streams.values().any(|stream| {
                stream.sender.as_ref().map_or(false, |sender| {
                    sender.has_pending_data() || sender.has_pending_reset()
                }) || stream
                    .receiver
                    .as_ref()
                    .map_or(false, |receiver| receiver.credit_update_needed())
            })
    }

    /// The ack delay value carried in our ACK frames for `space`.
    pub(crate) fn outgoing_ack_delay(space: &PacketSpace, now: Timestamp) -> u64 {
        let micros = space
            .largest_received_time
            .map(|t| now.saturating_duration_since(t).as_micros() as u64)
            .unwrap_or(0);
        micros >> LOCAL_ACK_DELAY_EXPONENT
    }

    /// Decodes a peer-reported ack delay into a duration.
    pub(crate) fn incoming_ack_delay(&self, raw: u64, epoch: Epoch) -> Duration {
        if epoch != Epoch::OneRtt {
            return Duration::ZERO;
        }
        let exponent = self
            .peer_params
            .as_ref()
            .map(|p| p.ack_delay_exponent())
            .unwrap_or(crate::transport::parameters::DEFAULT_ACK_DELAY_EXPONENT);
        let micros = raw.checked_shl(exponent.min(20) as u32).unwrap_or(u64::MAX);
        Duration::from_micros(micros)
    }

    pub(crate) fn ack_send_delay(&self, epoch: Epoch) -> Duration {
        if epoch == Epoch::OneRtt {
            LOCAL_MAX_ACK_DELAY
        } else {
            Duration::ZERO
        }
    }
}

/// The set of frame types permitted in each epoch.
pub(crate) fn frame_allowed_in_epoch(frame_type: u64, epoch: Epoch) -> bool {
    use crate::frame::type_id;
    match epoch {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-12.4
        //# PADDING, PING, ACK, CRYPTO and CONNECTION_CLOSE (type 0x1c)
        //# frames may appear in Initial and Handshake packets.
        Epoch::Initial | Epoch::Handshake => matches!(
            frame_type,
            type_id::PADDING
                | type_id::PING
                | type_id::ACK
                | type_id::ACK_ECN
                | type_id::CRYPTO
                | type_id::TRANSPORT_CLOSE
        ),
        Epoch::OneRtt => true,
    }
}

