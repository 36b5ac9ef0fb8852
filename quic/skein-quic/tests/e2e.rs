// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end scenarios: two connections pumping datagrams at each other
//! through an in-memory network, using the null crypto suite and the
//! deterministic handshake driver.

use bytes::Bytes;
use core::time::Duration;
use skein_quic::{
    cid::ConnectionId,
    connection::{Connection, State},
    event::Event,
    packet,
    random,
    time::Timestamp,
    tls::testing as tls_testing,
    Configuration,
};
use skein_codec::Buffer;
use std::net::SocketAddr;

fn client_addr() -> SocketAddr {
    "10.0.0.1:4433".parse().unwrap()
}

fn server_addr() -> SocketAddr {
    "10.0.0.2:4433".parse().unwrap()
}

fn ts(millis: u64) -> Timestamp {
    Timestamp::from_duration(Duration::from_millis(millis))
}

fn client_config() -> Configuration {
    Configuration {
        alpn_protocols: vec!["siduck".into()],
        is_client: true,
        ..Configuration::default()
    }
}

fn server_config() -> Configuration {
    Configuration {
        alpn_protocols: vec!["siduck".into()],
        is_client: false,
        ..Configuration::default()
    }
}

fn new_client(config: Configuration, ticket: Option<Bytes>, now: Timestamp) -> Connection {
    let tls = Box::new(tls_testing::Session::client(
        config.alpn_protocols.clone(),
        ticket,
    ));
    let rng = Box::new(random::testing::Generator::new(7));
    Connection::new_client(config, tls, rng, server_addr(), now).expect("client starts")
}

/// A miniature server endpoint: routes the first datagram into a new
/// connection, optionally after a Retry exchange.
struct ServerEndpoint {
    config: Configuration,
    issue_ticket: bool,
    retry: bool,
    corrupt_retry_tag: bool,
    retry_scid: ConnectionId,
    tokens: Vec<(Vec<u8>, ConnectionId)>,
    raw_responses: Vec<Vec<u8>>,
    connection: Option<Connection>,
    rng_seed: u64,
}

impl ServerEndpoint {
    fn new(config: Configuration) -> Self {
        Self {
            config,
            issue_ticket: false,
            retry: false,
            corrupt_retry_tag: false,
            retry_scid: ConnectionId::try_from_slice(&[0x5c; 8]).unwrap(),
            tokens: Vec::new(),
            raw_responses: Vec::new(),
            connection: None,
            rng_seed: 99,
        }
    }

    fn handle_datagram(&mut self, data: &[u8], now: Timestamp) {
        if let Some(connection) = &mut self.connection {
            connection.receive_datagram(data, client_addr(), now);
            return;
        }

        let mut buf = Buffer::from_slice(data);
        let header = match packet::pull_header(&mut buf, 8) {
            Ok(header) => header,
            Err(_) => return,
        };
        if header.packet_type != packet::PacketType::Initial {
            return;
        }

        if self.retry && header.token.is_empty() {
            // hand out a token bound to the original destination cid
            let mut token = b"tok:".to_vec();
            token.extend_from_slice(header.destination_cid.as_ref());
            let zero_tag = [0u8; 16];
            let unsigned = packet::encode_retry(
                header.version,
                &header.source_cid,
                &self.retry_scid,
                &token,
                &zero_tag,
            );
            let pseudo = packet::retry_pseudo_packet(
                &header.destination_cid,
                &unsigned[..unsigned.len() - 16],
            );
            let mut tag = tls_testing::retry_tag(&pseudo);
            if self.corrupt_retry_tag {
                tag[0] ^= 0xff;
            }
            let retry = packet::encode_retry(
                header.version,
                &header.source_cid,
                &self.retry_scid,
                &token,
                &tag,
            );
            self.tokens.push((token, header.destination_cid));
            self.raw_responses.push(retry);
            return;
        }

        let original_destination_cid = if self.retry {
            let Some((_, odcid)) = self
                .tokens
                .iter()
                .find(|(token, _)| token.as_slice() == &header.token[..])
            else {
                // invalid token: the connection attempt goes nowhere
                return;
            };
            *odcid
        } else {
            header.destination_cid
        };

        let tls = Box::new(tls_testing::Session::server(
            self.config.alpn_protocols.clone(),
            self.issue_ticket,
        ));
        let rng = Box::new(random::testing::Generator::new(self.rng_seed));
        let mut connection = Connection::new_server(
            self.config.clone(),
            tls,
            rng,
            original_destination_cid,
            self.retry.then_some(self.retry_scid),
            client_addr(),
            now,
        );
        connection.receive_datagram(data, client_addr(), now);
        self.connection = Some(connection);
    }

    fn poll_transmit(&mut self, now: Timestamp) -> Vec<Vec<u8>> {
        let mut out = core::mem::take(&mut self.raw_responses);
        if let Some(connection) = &mut self.connection {
            let (datagrams, _) = connection.datagrams_to_send(now);
            out.extend(datagrams);
        }
        out
    }

    fn get_timer(&self) -> Option<Timestamp> {
        self.connection.as_ref().and_then(Connection::get_timer)
    }

    fn handle_timer(&mut self, now: Timestamp) {
        if let Some(connection) = &mut self.connection {
            connection.handle_timer(now);
        }
    }

    fn drain_events(&mut self, into: &mut Vec<Event>) {
        if let Some(connection) = &mut self.connection {
            while let Some(event) = connection.next_event() {
                into.push(event);
            }
        }
    }
}

struct Sim {
    client: Connection,
    server: ServerEndpoint,
    now: Timestamp,
    /// Drop every `1/drop_modulus` datagrams when set.
    drop_modulus: Option<u64>,
    counter: u64,
    client_events: Vec<Event>,
    server_events: Vec<Event>,
}

impl Sim {
    fn new(client: Connection, server: ServerEndpoint) -> Self {
        Self {
            client,
            server,
            now: ts(10),
            drop_modulus: None,
            counter: 0,
            client_events: Vec::new(),
            server_events: Vec::new(),
        }
    }

    fn should_drop(&mut self) -> bool {
        self.counter += 1;
        self.drop_modulus
            .map_or(false, |modulus| self.counter % modulus == 0)
    }

    /// One exchange round. Returns true when any datagram moved.
    fn step(&mut self) -> bool {
        let mut progress = false;

        let (to_server, _) = self.client.datagrams_to_send(self.now);
        for datagram in to_server {
            assert!(datagram.len() <= 1452, "datagram exceeds the maximum size");
            if !self.should_drop() {
                self.server.handle_datagram(&datagram, self.now);
                progress = true;
            }
        }
        self.server.drain_events(&mut self.server_events);

        for datagram in self.server.poll_transmit(self.now) {
            assert!(datagram.len() <= 1452, "datagram exceeds the maximum size");
            if !self.should_drop() {
                self.client.receive_datagram(&datagram, server_addr(), self.now);
                progress = true;
            }
        }
        while let Some(event) = self.client.next_event() {
            self.client_events.push(event);
        }
        self.server.drain_events(&mut self.server_events);

        progress
    }

    fn run_until<F: Fn(&Sim) -> bool>(&mut self, predicate: F, max_rounds: usize) -> bool {
        for _ in 0..max_rounds {
            if predicate(self) {
                return true;
            }
            let progress = self.step();
            if predicate(self) {
                return true;
            }
            self.now = self.now + Duration::from_millis(1);
            if !progress {
                // idle: jump the clock to the earliest armed timer
                let deadline = [self.client.get_timer(), self.server.get_timer()]
                    .into_iter()
                    .flatten()
                    .min();
                let Some(deadline) = deadline else {
                    return predicate(self);
                };
                if deadline > self.now {
                    self.now = deadline + Duration::from_millis(1);
                }
                self.client.handle_timer(self.now);
                self.server.handle_timer(self.now);
            }
        }
        predicate(self)
    }

    fn run_handshake(&mut self) {
        assert!(
            self.run_until(
                |sim| {
                    sim.client.is_handshake_complete()
                        && sim
                            .server
                            .connection
                            .as_ref()
                            .map_or(false, Connection::is_handshake_complete)
                },
                200,
            ),
            "handshake did not complete"
        );
    }
}

fn handshake_completed(events: &[Event]) -> Option<(Option<String>, bool, bool)> {
    events.iter().find_map(|event| match event {
        Event::HandshakeCompleted {
            alpn_protocol,
            early_data_accepted,
            session_resumed,
        } => Some((
            alpn_protocol.clone(),
            *early_data_accepted,
            *session_resumed,
        )),
        _ => None,
    })
}

fn stream_data(events: &[Event], id: u64) -> (Vec<u8>, bool) {
    let mut data = Vec::new();
    let mut fin = false;
    for event in events {
        if let Event::StreamDataReceived {
            stream_id,
            data: chunk,
            end_stream,
        } = event
        {
            if *stream_id == id {
                assert!(!fin, "data delivered after FIN");
                data.extend_from_slice(chunk);
                fin |= *end_stream;
            }
        }
    }
    (data, fin)
}

#[test]
fn ping_pong_stream() {
    let mut sim = Sim::new(
        new_client(client_config(), None, ts(10)),
        ServerEndpoint::new(server_config()),
    );
    sim.run_handshake();

    let (alpn, early, resumed) = handshake_completed(&sim.client_events).expect("client event");
    assert_eq!(alpn.as_deref(), Some("siduck"));
    assert!(!early);
    assert!(!resumed);
    assert!(handshake_completed(&sim.server_events).is_some());

    // handshake events precede all stream events
    assert!(sim
        .client_events
        .iter()
        .all(|e| !matches!(e, Event::StreamDataReceived { .. })));

    sim.client.send_stream_data(0, b"ping", true).unwrap();
    assert!(sim.run_until(|sim| stream_data(&sim.server_events, 0).1, 100));
    let (payload, fin) = stream_data(&sim.server_events, 0);
    assert_eq!(payload, b"ping");
    assert!(fin);

    let mut reversed = payload;
    reversed.reverse();
    let server = sim.server.connection.as_mut().unwrap();
    server.send_stream_data(0, &reversed, true).unwrap();
    assert!(sim.run_until(|sim| stream_data(&sim.client_events, 0).1, 100));
    let (payload, fin) = stream_data(&sim.client_events, 0);
    assert_eq!(payload, b"gnip");
    assert!(fin);
}

#[test]
fn large_transfer_raises_flow_control_limits() {
    const SIZE: usize = 2 * 1024 * 1024;

    let mut sim = Sim::new(
        new_client(client_config(), None, ts(10)),
        ServerEndpoint::new(server_config()),
    );
    sim.run_handshake();

    let blob = vec![b'Z'; SIZE];
    sim.client.send_stream_data(0, &blob, true).unwrap();

    assert!(
        sim.run_until(|sim| stream_data(&sim.server_events, 0).1, 50_000),
        "transfer did not finish"
    );
    let (payload, _) = stream_data(&sim.server_events, 0);
    assert_eq!(payload.len(), SIZE);
    // the transfer is larger than the initial 1 MiB connection window, so
    // completing it proves MAX_DATA and MAX_STREAM_DATA were raised
    assert!(payload.iter().all(|&b| b == b'Z'));

    let mut reversed = payload;
    reversed.reverse();
    let server = sim.server.connection.as_mut().unwrap();
    server.send_stream_data(0, &reversed, true).unwrap();
    assert!(
        sim.run_until(|sim| stream_data(&sim.client_events, 0).1, 50_000),
        "echo did not finish"
    );
    let (payload, _) = stream_data(&sim.client_events, 0);
    assert_eq!(payload.len(), SIZE);
}

#[test]
fn stream_sizes_round_trip() {
    for &size in &[1usize, 1199, 1200, 65_536] {
        let mut sim = Sim::new(
            new_client(client_config(), None, ts(10)),
            ServerEndpoint::new(server_config()),
        );
        sim.run_handshake();

        let blob: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        sim.client.send_stream_data(0, &blob, true).unwrap();
        assert!(
            sim.run_until(|sim| stream_data(&sim.server_events, 0).1, 5_000),
            "{size} byte transfer stalled"
        );
        let (payload, fin) = stream_data(&sim.server_events, 0);
        assert_eq!(payload, blob, "{size} byte transfer corrupted");
        assert!(fin);
    }
}

#[test]
fn probes_keep_firing_without_acknowledgments() {
    let mut sim = Sim::new(
        new_client(client_config(), None, ts(10)),
        ServerEndpoint::new(server_config()),
    );
    sim.run_handshake();
    // flush post-handshake chatter so only our data is outstanding
    sim.run_until(|_| false, 20);

    sim.client
        .send_stream_data(0, b"unacknowledged", true)
        .unwrap();
    let (first, _) = sim.client.datagrams_to_send(sim.now);
    assert!(!first.is_empty());

    // the network goes silent; every PTO cycle must still emit a probe
    let mut probes = 0;
    for _ in 0..4 {
        let deadline = sim.client.get_timer().expect("a timer stays armed");
        sim.now = deadline + Duration::from_millis(1);
        sim.client.handle_timer(sim.now);
        let (datagrams, _) = sim.client.datagrams_to_send(sim.now);
        if !datagrams.is_empty() {
            probes += 1;
        }
    }
    assert!(probes >= 3, "only {probes} probe rounds observed");
}

#[test]
fn ping_pong_survives_25_percent_loss() {
    let mut sim = Sim::new(
        new_client(client_config(), None, ts(10)),
        ServerEndpoint::new(server_config()),
    );
    sim.drop_modulus = Some(4);

    assert!(
        sim.run_until(
            |sim| {
                sim.client.is_handshake_complete()
                    && sim
                        .server
                        .connection
                        .as_ref()
                        .map_or(false, Connection::is_handshake_complete)
            },
            2_000,
        ),
        "handshake did not survive loss"
    );

    sim.client.send_stream_data(0, b"ping", true).unwrap();
    assert!(sim.run_until(|sim| stream_data(&sim.server_events, 0).1, 2_000));
    assert_eq!(stream_data(&sim.server_events, 0).0, b"ping");

    let server = sim.server.connection.as_mut().unwrap();
    server.send_stream_data(0, b"gnip", true).unwrap();
    assert!(sim.run_until(|sim| stream_data(&sim.client_events, 0).1, 2_000));
    assert_eq!(stream_data(&sim.client_events, 0).0, b"gnip");
}

#[test]
fn session_resumption_round_trip() {
    // first connection: obtain a ticket
    let mut server = ServerEndpoint::new(server_config());
    server.issue_ticket = true;
    let mut sim = Sim::new(new_client(client_config(), None, ts(10)), server);
    sim.run_handshake();
    assert!(
        sim.run_until(|sim| sim.client.tls_session_ticket().is_some(), 100),
        "no session ticket arrived"
    );
    let ticket = sim.client.tls_session_ticket().unwrap().clone();
    let (_, _, resumed) = handshake_completed(&sim.client_events).unwrap();
    assert!(!resumed);

    // second connection presents the ticket
    let mut config = client_config();
    config.tls.session_ticket = Some(ticket.clone());
    let client = {
        let tls = Box::new(tls_testing::Session::client(
            config.alpn_protocols.clone(),
            Some(ticket),
        ));
        let rng = Box::new(random::testing::Generator::new(8));
        Connection::new_client(config, tls, rng, server_addr(), ts(10)).unwrap()
    };
    let mut sim = Sim::new(client, ServerEndpoint::new(server_config()));
    sim.run_handshake();
    let (_, _, resumed) = handshake_completed(&sim.client_events).unwrap();
    assert!(resumed);
}

#[test]
fn retry_round_trip() {
    let mut server = ServerEndpoint::new(server_config());
    server.retry = true;
    let mut sim = Sim::new(new_client(client_config(), None, ts(10)), server);
    sim.run_handshake();

    sim.client.send_stream_data(0, b"ping", true).unwrap();
    assert!(sim.run_until(|sim| stream_data(&sim.server_events, 0).1, 200));
    assert_eq!(stream_data(&sim.server_events, 0).0, b"ping");
}

#[test]
fn corrupted_retry_token_fails_before_handshake() {
    let mut server = ServerEndpoint::new(server_config());
    server.retry = true;
    server.corrupt_retry_tag = true;
    let mut sim = Sim::new(new_client(client_config(), None, ts(10)), server);

    // the client rejects the forged Retry, the server never answers the
    // handshake, and the attempt dies without completing
    assert!(!sim.run_until(|sim| sim.client.is_handshake_complete(), 300));
    assert!(!sim.client.is_handshake_complete());
}

#[test]
fn version_negotiation_settles_on_v1() {
    let mut config = client_config();
    config.supported_versions = vec![0x1a2a_3a4a, 0x0000_0001];
    let mut sim = Sim::new(
        new_client(config, None, ts(10)),
        ServerEndpoint::new(server_config()),
    );
    sim.run_handshake();
    assert_eq!(sim.client.version(), 0x0000_0001);

    sim.client.send_stream_data(0, b"ping", true).unwrap();
    assert!(sim.run_until(|sim| stream_data(&sim.server_events, 0).1, 200));
}

#[test]
fn siduck_datagram_exchange() {
    let mut client_config = client_config();
    client_config.max_datagram_frame_size = Some(65_536);
    let mut server_config = server_config();
    server_config.max_datagram_frame_size = Some(65_536);

    let mut sim = Sim::new(
        new_client(client_config, None, ts(10)),
        ServerEndpoint::new(server_config),
    );
    sim.run_handshake();

    sim.client
        .send_datagram_frame(Bytes::from_static(b"quack"))
        .unwrap();
    assert!(sim.run_until(
        |sim| sim
            .server_events
            .iter()
            .any(|e| matches!(e, Event::DatagramFrameReceived { data } if &data[..] == b"quack")),
        100
    ));

    let server = sim.server.connection.as_mut().unwrap();
    server
        .send_datagram_frame(Bytes::from_static(b"quack-ack"))
        .unwrap();
    assert!(sim.run_until(
        |sim| sim.client_events.iter().any(
            |e| matches!(e, Event::DatagramFrameReceived { data } if &data[..] == b"quack-ack")
        ),
        100
    ));
}

#[test]
fn key_update_and_cid_change_commute_with_streams() {
    let mut sim = Sim::new(
        new_client(client_config(), None, ts(10)),
        ServerEndpoint::new(server_config()),
    );
    sim.run_handshake();
    // settle post-handshake frames (connection id issuance)
    sim.run_until(|_| false, 20);

    sim.client.request_key_update();
    sim.client.send_stream_data(0, b"first half ", false).unwrap();
    assert!(sim.run_until(|sim| !stream_data(&sim.server_events, 0).0.is_empty(), 100));

    sim.client.change_connection_id();
    sim.client.send_stream_data(0, b"second half", true).unwrap();
    assert!(sim.run_until(|sim| stream_data(&sim.server_events, 0).1, 200));
    assert_eq!(
        stream_data(&sim.server_events, 0).0,
        b"first half second half"
    );
}

#[test]
fn idle_timeout_terminates_silently() {
    let mut sim = Sim::new(
        new_client(client_config(), None, ts(10)),
        ServerEndpoint::new(server_config()),
    );
    sim.run_handshake();

    // no traffic for longer than the 60 second idle timeout
    sim.now = sim.now + Duration::from_secs(61);
    sim.client.handle_timer(sim.now);
    assert_eq!(sim.client.state(), State::Terminated);
    while let Some(event) = sim.client.next_event() {
        sim.client_events.push(event);
    }
    assert!(sim.client_events.iter().any(|e| matches!(
        e,
        Event::ConnectionTerminated {
            error_code: 0,
            reason_phrase,
            ..
        } if reason_phrase == "Idle timeout"
    )));
}

#[test]
fn application_close_reaches_the_peer() {
    let mut sim = Sim::new(
        new_client(client_config(), None, ts(10)),
        ServerEndpoint::new(server_config()),
    );
    sim.run_handshake();

    sim.client.close(0x20, None, "kthxbye");
    assert!(sim.run_until(
        |sim| sim.server_events.iter().any(|e| matches!(
            e,
            Event::ConnectionTerminated { error_code: 0x20, .. }
        )),
        100
    ));
}

#[test]
fn server_issued_token_reaches_the_client() {
    let mut sim = Sim::new(
        new_client(client_config(), None, ts(10)),
        ServerEndpoint::new(server_config()),
    );
    sim.run_handshake();

    let server = sim.server.connection.as_mut().unwrap();
    server
        .send_new_token(Bytes::from_static(b"addr-validation-token"))
        .unwrap();
    // clients never issue tokens
    assert!(sim
        .client
        .send_new_token(Bytes::from_static(b"nope"))
        .is_err());

    assert!(sim.run_until(
        |sim| sim
            .client
            .address_validation_token()
            .map_or(false, |token| &token[..] == b"addr-validation-token"),
        100
    ));
}

#[test]
fn ping_is_acknowledged() {
    let mut sim = Sim::new(
        new_client(client_config(), None, ts(10)),
        ServerEndpoint::new(server_config()),
    );
    sim.run_handshake();

    let uid = sim.client.ping();
    assert!(sim.run_until(
        |sim| sim
            .client_events
            .iter()
            .any(|e| matches!(e, Event::PingAcknowledged { uid: got } if *got == uid)),
        100
    ));
}
