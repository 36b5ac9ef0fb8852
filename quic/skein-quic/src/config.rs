// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Immutable per-connection parameters.

use crate::trace::TraceHandler;
use bytes::Bytes;
use core::time::Duration;
use std::sync::Arc;

/// The QUIC version this crate implements.
pub const QUIC_VERSION_1: u32 = 0x0000_0001;

/// Hard upper bound for emitted datagrams (conservative IPv6 MTU minus
/// overhead).
pub const PACKET_MAX_SIZE: usize = 1452;

/// Certificate verification behavior requested from the TLS collaborator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VerifyMode {
    #[default]
    Required,
    Optional,
    None,
}

/// Options forwarded opaquely to the TLS collaborator. The transport core
/// never interprets these.
#[derive(Clone, Debug, Default)]
pub struct TlsOptions {
    /// SNI. Expected in A-label (IDN-encoded) form.
    pub server_name: Option<String>,
    pub verify_mode: VerifyMode,
    pub verify_hostname: bool,
    pub certificate: Option<Bytes>,
    pub private_key: Option<Bytes>,
    pub cafile: Option<String>,
    pub cadata: Option<Bytes>,
    /// Ticket from a previous connection, enabling session resumption.
    pub session_ticket: Option<Bytes>,
    /// SSLKEYLOGFILE destination.
    pub secrets_log_file: Option<String>,
}

#[derive(Clone)]
pub struct Configuration {
    /// Ordered ALPN preferences.
    pub alpn_protocols: Vec<String>,
    pub is_client: bool,
    /// Largest acceptable DATAGRAM frame; `None` (or 0) disables the
    /// extension.
    pub max_datagram_frame_size: Option<u64>,
    pub idle_timeout: Duration,
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    /// Upper bound for emitted datagrams once the path is confirmed.
    pub max_datagram_size: usize,
    /// Ordered version preferences.
    pub supported_versions: Vec<u32>,
    /// Length of locally issued connection IDs.
    pub connection_id_length: usize,
    /// Version to advertise in the first flight when testing version
    /// negotiation.
    pub original_version: Option<u32>,
    /// Address-validation token obtained from a previous connection
    /// (NEW_TOKEN) and replayed in the first INITIAL.
    pub token: Bytes,
    /// Trace sink; `None` means no tracing.
    pub quic_logger: Option<Arc<dyn TraceHandler>>,
    pub tls: TlsOptions,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            alpn_protocols: Vec::new(),
            is_client: true,
            max_datagram_frame_size: None,
            idle_timeout: Duration::from_secs(60),
            initial_max_data: 1024 * 1024,
            initial_max_stream_data_bidi_local: 1024 * 1024,
            initial_max_stream_data_bidi_remote: 1024 * 1024,
            initial_max_stream_data_uni: 1024 * 1024,
            initial_max_streams_bidi: 128,
            initial_max_streams_uni: 128,
            max_datagram_size: PACKET_MAX_SIZE,
            supported_versions: vec![QUIC_VERSION_1],
            connection_id_length: 8,
            original_version: None,
            token: Bytes::new(),
            quic_logger: None,
            tls: TlsOptions::default(),
        }
    }
}

impl core::fmt::Debug for Configuration {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Configuration")
            .field("is_client", &self.is_client)
            .field("alpn_protocols", &self.alpn_protocols)
            .field("supported_versions", &self.supported_versions)
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}
