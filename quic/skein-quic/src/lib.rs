// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Sans-I/O QUIC v1 (RFC 9000/9001/9002) transport core.
//!
//! The crate owns the per-connection state machine: packet numbering,
//! encryption epochs, loss detection, congestion control, flow control,
//! streams and the frame codecs, plus the packet builder that turns pending
//! frames into size-bounded, encrypted, coalesced datagrams.
//!
//! The core performs no I/O and spawns no tasks. An embedder drives a
//! [`connection::Connection`] with four entry points: feed it received
//! datagrams, drain datagrams to send, fire expired timers, and issue
//! application calls (stream writes, pings, close). TLS and AEAD are
//! collaborators behind the [`tls`] and [`crypto`] seams.

pub mod builder;
pub mod cid;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod event;
pub mod frame;
pub mod packet;
pub mod random;
pub mod ranges;
pub mod recovery;
pub mod stream;
pub mod time;
pub mod tls;
pub mod trace;
pub mod transport;

pub use config::Configuration;
pub use connection::Connection;
pub use event::Event;
pub use time::Timestamp;
pub use transport::error::TransportError;
