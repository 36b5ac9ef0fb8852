// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Pluggable event-trace sink.
//!
//! The connection reports wire-level activity to a [`TraceHandler`] supplied
//! through the configuration. Implementations feed qlog writers, metrics, or
//! test probes; the default sink discards everything.

use crate::crypto::Epoch;

pub trait TraceHandler: Send {
    fn on_packet_sent(&self, epoch: Epoch, packet_number: u64, sent_bytes: usize) {
        let _ = (epoch, packet_number, sent_bytes);
    }

    fn on_packet_received(&self, epoch: Epoch, packet_number: u64) {
        let _ = (epoch, packet_number);
    }

    /// A datagram or packet was discarded before processing.
    fn on_packet_dropped(&self, reason: &'static str) {
        let _ = reason;
    }

    fn on_packets_lost(&self, epoch: Epoch, packet_numbers: &[u64]) {
        let _ = (epoch, packet_numbers);
    }

    fn on_recovery_metrics(
        &self,
        bytes_in_flight: usize,
        congestion_window: usize,
        smoothed_rtt: core::time::Duration,
    ) {
        let _ = (bytes_in_flight, congestion_window, smoothed_rtt);
    }

    fn on_key_update(&self, key_phase: u8) {
        let _ = key_phase;
    }

    fn on_connection_closed(&self, error_code: u64, reason: &str) {
        let _ = (error_code, reason);
    }
}

/// Sink that discards every record.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopTraceHandler;

impl TraceHandler for NoopTraceHandler {}
