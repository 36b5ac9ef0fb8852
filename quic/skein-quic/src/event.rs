// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Events surfaced to the embedder.
//!
//! The connection queues events as it processes inbound frames and timers;
//! the embedder drains them with [`crate::Connection::next_event`]. The set
//! is closed: consumers pattern-match, no downcasting.

use bytes::Bytes;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// A new connection ID was issued to the peer.
    ConnectionIdIssued { connection_id: Bytes },

    /// A previously issued connection ID was retired.
    ConnectionIdRetired { connection_id: Bytes },

    /// The TLS handshake completed.
    HandshakeCompleted {
        /// The protocol negotiated via ALPN, if any.
        alpn_protocol: Option<String>,
        /// Whether early (0-RTT) data was accepted by the peer.
        early_data_accepted: bool,
        /// Whether a TLS session was resumed.
        session_resumed: bool,
    },

    /// The connection reached its terminal state.
    ConnectionTerminated {
        error_code: u64,
        frame_type: Option<u64>,
        reason_phrase: String,
    },

    /// ALPN negotiation completed.
    ProtocolNegotiated { alpn_protocol: Option<String> },

    /// Data was received on a stream.
    StreamDataReceived {
        stream_id: u64,
        data: Bytes,
        /// Whether the STREAM frame carried the FIN bit.
        end_stream: bool,
    },

    /// The peer reset a stream.
    StreamReset { stream_id: u64, error_code: u64 },

    /// The peer requested that we stop sending on a stream.
    StopSendingReceived { stream_id: u64, error_code: u64 },

    /// A PING frame we sent was acknowledged.
    PingAcknowledged { uid: u64 },

    /// An unreliable DATAGRAM frame was received.
    DatagramFrameReceived { data: Bytes },
}
