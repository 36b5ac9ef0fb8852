// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Interface to the TLS 1.3 handshake collaborator.
//!
//! The transport feeds the collaborator reassembled CRYPTO-stream bytes per
//! epoch and receives back the next burst to transmit, keys to install, the
//! peer's transport parameters and the handshake outcome. The collaborator
//! never touches packets; packet protection is applied by the transport
//! using the installed keys.

use crate::crypto::{Epoch, KeySet};
use bytes::Bytes;
use core::fmt;

/// A fatal handshake failure, reported on the wire as CRYPTO_ERROR plus the
/// TLS alert description.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Error {
    pub alert: u8,
    pub reason: &'static str,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TLS alert {}: {}", self.alert, self.reason)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// Result of a completed handshake.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HandshakeOutcome {
    pub alpn_protocol: Option<String>,
    pub session_resumed: bool,
    pub early_data_accepted: bool,
}

/// Everything a call into the collaborator produced.
#[derive(Default)]
pub struct Output {
    /// CRYPTO-stream bytes to transmit, per epoch, in order.
    pub bursts: Vec<(Epoch, Vec<u8>)>,
    pub handshake_keys: Option<KeySet>,
    pub one_rtt_keys: Option<KeySet>,
    /// The peer's raw transport parameter extension.
    pub peer_transport_parameters: Option<Vec<u8>>,
    pub handshake_complete: Option<HandshakeOutcome>,
    /// A session ticket delivered post-handshake.
    pub session_ticket: Option<Bytes>,
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Output")
            .field("bursts", &self.bursts)
            .field("handshake_keys", &self.handshake_keys.is_some())
            .field("one_rtt_keys", &self.one_rtt_keys.is_some())
            .field("peer_transport_parameters", &self.peer_transport_parameters)
            .field("handshake_complete", &self.handshake_complete)
            .field("session_ticket", &self.session_ticket)
            .finish()
    }
}

impl Output {
    pub fn merge(&mut self, other: Output) {
        self.bursts.extend(other.bursts);
        self.handshake_keys = self.handshake_keys.take().or(other.handshake_keys);
        self.one_rtt_keys = self.one_rtt_keys.take().or(other.one_rtt_keys);
        self.peer_transport_parameters = self
            .peer_transport_parameters
            .take()
            .or(other.peer_transport_parameters);
        self.handshake_complete = self.handshake_complete.take().or(other.handshake_complete);
        self.session_ticket = self.session_ticket.take().or(other.session_ticket);
    }
}

pub trait Session: Send {
    /// Installs the serialized local transport parameters carried in the
    /// handshake. Must be called before [`Session::start`] or the first
    /// [`Session::handle_crypto`].
    fn set_transport_parameters(&mut self, local: &[u8]);

    /// Derives the Initial packet-protection keys for `dcid`.
    ///
    /// Called again after Retry or version change, when the client's
    /// destination connection ID changes.
    fn initial_keys(&mut self, version: u32, dcid: &[u8], is_client: bool) -> KeySet;

    /// Produces the client's first flight. Servers return an empty output.
    fn start(&mut self) -> Result<Output, Error>;

    /// Feeds reassembled CRYPTO bytes received in `epoch`.
    fn handle_crypto(&mut self, epoch: Epoch, data: &[u8]) -> Result<Output, Error>;

    /// Verifies a Retry packet's integrity tag (client side).
    fn verify_retry(&mut self, pseudo_packet: &[u8], tag: &[u8; 16]) -> bool;
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    //! A deterministic handshake driver.
    //!
    //! Plays a miniature TLS: ClientHello and ServerHello carry the
    //! transport parameters and ALPN, Finished completes each side, and an
    //! optional NewSessionTicket flows post-handshake. Keys are the null
    //! suite from [`crate::crypto::testing`].

    use super::*;
    use crate::crypto::testing::null_key_set;
    use skein_codec::Buffer;

    const CLIENT_HELLO: u8 = 1;
    const SERVER_HELLO: u8 = 2;
    const FINISHED: u8 = 3;
    const NEW_SESSION_TICKET: u8 = 4;

    const NO_APPLICATION_PROTOCOL: u8 = 120;
    const HANDSHAKE_FAILURE: u8 = 40;

    /// Computes the integrity tag the stub attaches to Retry packets.
    pub fn retry_tag(pseudo_packet: &[u8]) -> [u8; 16] {
        let mut acc: u64 = 0x5eed;
        for &byte in pseudo_packet {
            acc = acc.wrapping_mul(1099511628211).wrapping_add(byte as u64);
        }
        let mut tag = [0; 16];
        tag[..8].copy_from_slice(&acc.to_be_bytes());
        tag[8..].copy_from_slice(&acc.rotate_left(17).to_be_bytes());
        tag
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum State {
        Idle,
        AwaitServerHello,
        AwaitFinished,
        Complete,
    }

    pub struct Session {
        is_client: bool,
        alpn_protocols: Vec<String>,
        /// Client: ticket presented for resumption. Server: unused.
        session_ticket: Option<Bytes>,
        /// Server: issue a ticket once the handshake completes.
        issue_ticket: bool,
        local_transport_parameters: Vec<u8>,
        state: State,
        recv_buffers: [Vec<u8>; Epoch::COUNT],
        negotiated_alpn: Option<String>,
        resumed: bool,
    }

    impl Session {
        pub fn client(alpn_protocols: Vec<String>, session_ticket: Option<Bytes>) -> Self {
            Self::new(true, alpn_protocols, session_ticket, false)
        }

        pub fn server(alpn_protocols: Vec<String>, issue_ticket: bool) -> Self {
            Self::new(false, alpn_protocols, None, issue_ticket)
        }

        fn new(
            is_client: bool,
            alpn_protocols: Vec<String>,
            session_ticket: Option<Bytes>,
            issue_ticket: bool,
        ) -> Self {
            Self {
                is_client,
                alpn_protocols,
                session_ticket,
                issue_ticket,
                local_transport_parameters: Vec::new(),
                state: State::Idle,
                recv_buffers: Default::default(),
                negotiated_alpn: None,
                resumed: false,
            }
        }

        fn message(kind: u8, body: &[u8]) -> Vec<u8> {
            let mut out = Vec::with_capacity(3 + body.len());
            out.push(kind);
            out.extend_from_slice(&(body.len() as u16).to_be_bytes());
            out.extend_from_slice(body);
            out
        }

        fn client_hello(&self) -> Vec<u8> {
            let mut buf = Buffer::new(1024);
            buf.put_u16(self.local_transport_parameters.len() as u16)
                .unwrap();
            buf.put_bytes(&self.local_transport_parameters).unwrap();
            buf.put_u8(self.alpn_protocols.len() as u8).unwrap();
            for proto in &self.alpn_protocols {
                buf.put_u8(proto.len() as u8).unwrap();
                buf.put_bytes(proto.as_bytes()).unwrap();
            }
            match &self.session_ticket {
                Some(ticket) => {
                    buf.put_u8(1).unwrap();
                    buf.put_u16(ticket.len() as u16).unwrap();
                    buf.put_bytes(ticket).unwrap();
                }
                None => buf.put_u8(0).unwrap(),
            }
            Self::message(CLIENT_HELLO, buf.data())
        }

        fn server_hello(&self) -> Vec<u8> {
            let mut buf = Buffer::new(1024);
            buf.put_u16(self.local_transport_parameters.len() as u16)
                .unwrap();
            buf.put_bytes(&self.local_transport_parameters).unwrap();
            buf.put_u8(self.resumed as u8).unwrap();
            match &self.negotiated_alpn {
                Some(proto) => {
                    buf.put_u8(1).unwrap();
                    buf.put_u8(proto.len() as u8).unwrap();
                    buf.put_bytes(proto.as_bytes()).unwrap();
                }
                None => buf.put_u8(0).unwrap(),
            }
            Self::message(SERVER_HELLO, buf.data())
        }

        fn outcome(&self) -> HandshakeOutcome {
            HandshakeOutcome {
                alpn_protocol: self.negotiated_alpn.clone(),
                session_resumed: self.resumed,
                early_data_accepted: false,
            }
        }

        /// Pops the next complete `[kind, len, body]` message, if any.
        fn next_message(buffer: &mut Vec<u8>) -> Option<(u8, Vec<u8>)> {
            if buffer.len() < 3 {
                return None;
            }
            let kind = buffer[0];
            let len = u16::from_be_bytes([buffer[1], buffer[2]]) as usize;
            if buffer.len() < 3 + len {
                return None;
            }
            let body = buffer[3..3 + len].to_vec();
            buffer.drain(..3 + len);
            Some((kind, body))
        }

        fn on_client_hello(&mut self, body: &[u8], output: &mut Output) -> Result<(), Error> {
            let mut buf = Buffer::from_slice(body);
            let parse = Error {
                alert: HANDSHAKE_FAILURE,
                reason: "malformed ClientHello",
            };
            let tp_len = buf.get_u16().map_err(|_| parse)? as usize;
            let peer_tp = buf.get_bytes(tp_len).map_err(|_| parse)?.to_vec();
            let count = buf.get_u8().map_err(|_| parse)?;
            let mut offered = Vec::new();
            for _ in 0..count {
                let len = buf.get_u8().map_err(|_| parse)? as usize;
                let proto = buf.get_bytes(len).map_err(|_| parse)?;
                offered.push(String::from_utf8_lossy(proto).into_owned());
            }
            if buf.get_u8().map_err(|_| parse)? == 1 {
                let len = buf.get_u16().map_err(|_| parse)? as usize;
                let _ticket = buf.get_bytes(len).map_err(|_| parse)?;
                self.resumed = true;
            }

            if self.alpn_protocols.is_empty() {
                self.negotiated_alpn = None;
            } else {
                self.negotiated_alpn = offered
                    .iter()
                    .find(|proto| self.alpn_protocols.contains(proto))
                    .cloned();
                if self.negotiated_alpn.is_none() {
                    return Err(Error {
                        alert: NO_APPLICATION_PROTOCOL,
                        reason: "no common ALPN protocol",
                    });
                }
            }

            output.peer_transport_parameters = Some(peer_tp);
            output.bursts.push((Epoch::Initial, self.server_hello()));
            output
                .bursts
                .push((Epoch::Handshake, Self::message(FINISHED, &[])));
            output.handshake_keys = Some(null_key_set(b"handshake", Epoch::Handshake));
            output.one_rtt_keys = Some(null_key_set(b"application", Epoch::OneRtt));
            self.state = State::AwaitFinished;
            Ok(())
        }

        fn on_server_hello(&mut self, body: &[u8], output: &mut Output) -> Result<(), Error> {
            let mut buf = Buffer::from_slice(body);
            let parse = Error {
                alert: HANDSHAKE_FAILURE,
                reason: "malformed ServerHello",
            };
            let tp_len = buf.get_u16().map_err(|_| parse)? as usize;
            let peer_tp = buf.get_bytes(tp_len).map_err(|_| parse)?.to_vec();
            self.resumed = buf.get_u8().map_err(|_| parse)? == 1;
            if buf.get_u8().map_err(|_| parse)? == 1 {
                let len = buf.get_u8().map_err(|_| parse)? as usize;
                let proto = buf.get_bytes(len).map_err(|_| parse)?;
                self.negotiated_alpn = Some(String::from_utf8_lossy(proto).into_owned());
            }

            output.peer_transport_parameters = Some(peer_tp);
            output.handshake_keys = Some(null_key_set(b"handshake", Epoch::Handshake));
            self.state = State::AwaitFinished;
            Ok(())
        }

        fn on_finished(&mut self, output: &mut Output) -> Result<(), Error> {
            if self.is_client {
                output
                    .bursts
                    .push((Epoch::Handshake, Self::message(FINISHED, &[])));
                output.one_rtt_keys = Some(null_key_set(b"application", Epoch::OneRtt));
            } else if self.issue_ticket {
                let body = Self::message(NEW_SESSION_TICKET, b"resumption-ticket-1");
                output.bursts.push((Epoch::OneRtt, body));
            }
            output.handshake_complete = Some(self.outcome());
            self.state = State::Complete;
            Ok(())
        }
    }

    impl super::Session for Session {
        fn set_transport_parameters(&mut self, local: &[u8]) {
            self.local_transport_parameters = local.to_vec();
        }

        fn initial_keys(&mut self, _version: u32, dcid: &[u8], _is_client: bool) -> KeySet {
            null_key_set(dcid, Epoch::Initial)
        }

        fn start(&mut self) -> Result<Output, Error> {
            let mut output = Output::default();
            if self.is_client && self.state == State::Idle {
                output.bursts.push((Epoch::Initial, self.client_hello()));
                self.state = State::AwaitServerHello;
            }
            Ok(output)
        }

        fn handle_crypto(&mut self, epoch: Epoch, data: &[u8]) -> Result<Output, Error> {
            self.recv_buffers[epoch as usize].extend_from_slice(data);
            let mut output = Output::default();
            loop {
                let mut buffer = core::mem::take(&mut self.recv_buffers[epoch as usize]);
                let message = Self::next_message(&mut buffer);
                self.recv_buffers[epoch as usize] = buffer;
                let Some((kind, body)) = message else { break };

                match (kind, self.is_client) {
                    (CLIENT_HELLO, false) => self.on_client_hello(&body, &mut output)?,
                    (SERVER_HELLO, true) => self.on_server_hello(&body, &mut output)?,
                    (FINISHED, _) => self.on_finished(&mut output)?,
                    (NEW_SESSION_TICKET, true) => {
                        output.session_ticket = Some(Bytes::from(body));
                    }
                    _ => {
                        return Err(Error {
                            alert: HANDSHAKE_FAILURE,
                            reason: "unexpected handshake message",
                        })
                    }
                }
            }
            Ok(output)
        }

        fn verify_retry(&mut self, pseudo_packet: &[u8], tag: &[u8; 16]) -> bool {
            retry_tag(pseudo_packet) == *tag
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::tls::Session as _;

        fn pump(
            from: &mut Session,
            to: &mut Session,
            bursts: Vec<(Epoch, Vec<u8>)>,
        ) -> Result<Output, Error> {
            let _ = from;
            let mut merged = Output::default();
            for (epoch, data) in bursts {
                merged.merge(to.handle_crypto(epoch, &data)?);
            }
            Ok(merged)
        }

        #[test]
        fn full_handshake() {
            let mut client = Session::client(vec!["siduck".into()], None);
            let mut server = Session::server(vec!["siduck".into(), "hq".into()], false);
            client.set_transport_parameters(b"client-params");
            server.set_transport_parameters(b"server-params");

            let first = client.start().unwrap();
            let server_out = pump(&mut client, &mut server, first.bursts).unwrap();
            assert_eq!(
                server_out.peer_transport_parameters.as_deref(),
                Some(&b"client-params"[..])
            );
            assert!(server_out.handshake_keys.is_some());
            assert!(server_out.one_rtt_keys.is_some());

            let client_out = pump(&mut server, &mut client, server_out.bursts).unwrap();
            assert_eq!(
                client_out.peer_transport_parameters.as_deref(),
                Some(&b"server-params"[..])
            );
            let outcome = client_out.handshake_complete.clone().unwrap();
            assert_eq!(outcome.alpn_protocol.as_deref(), Some("siduck"));
            assert!(!outcome.session_resumed);

            let server_done = pump(&mut client, &mut server, client_out.bursts).unwrap();
            assert!(server_done.handshake_complete.is_some());
        }

        #[test]
        fn alpn_mismatch_is_fatal() {
            let mut client = Session::client(vec!["h3".into()], None);
            let mut server = Session::server(vec!["siduck".into()], false);
            client.set_transport_parameters(b"");
            server.set_transport_parameters(b"");

            let first = client.start().unwrap();
            let error = pump(&mut client, &mut server, first.bursts).unwrap_err();
            assert_eq!(error.alert, 120);
        }

        #[test]
        fn resumption_round_trip() {
            let mut client = Session::client(vec![], Some(Bytes::from_static(b"ticket")));
            let mut server = Session::server(vec![], true);
            client.set_transport_parameters(b"");
            server.set_transport_parameters(b"");

            let first = client.start().unwrap();
            let server_out = pump(&mut client, &mut server, first.bursts).unwrap();
            let client_out = pump(&mut server, &mut client, server_out.bursts).unwrap();
            assert!(client_out
                .handshake_complete
                .as_ref()
                .unwrap()
                .session_resumed);

            let server_done = pump(&mut client, &mut server, client_out.bursts).unwrap();
            // the ticket flows back to the client in the 1-RTT epoch
            let ticket_burst = server_done.bursts;
            assert!(!ticket_burst.is_empty());
            let client_ticket = pump(&mut server, &mut client, ticket_burst).unwrap();
            assert!(client_ticket.session_ticket.is_some());
        }
    }
}
