// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! NewReno congestion controller, RFC 9002 section 7.

use crate::time::Timestamp;

//= https://www.rfc-editor.org/rfc/rfc9002#section-7.2
//# Endpoints SHOULD use an initial congestion window of ten times the
//# maximum datagram size (max_datagram_size)
const K_INITIAL_WINDOW_PACKETS: usize = 10;

//= https://www.rfc-editor.org/rfc/rfc9002#section-7.2
//# The RECOMMENDED minimum congestion window is 2 * max_datagram_size.
const K_MINIMUM_WINDOW_PACKETS: usize = 2;

//= https://www.rfc-editor.org/rfc/rfc9002#section-7.3.1
//# slow start ... the congestion window MUST be halved when loss is
//# detected
const K_LOSS_REDUCTION_DIVISOR: usize = 2;

#[derive(Clone, Copy, Debug)]
pub struct CongestionController {
    max_datagram_size: usize,
    bytes_in_flight: usize,
    congestion_window: usize,
    /// `usize::MAX` until the first loss event.
    ssthresh: usize,
    recovery_start_time: Option<Timestamp>,
}

impl CongestionController {
    pub fn new(max_datagram_size: usize) -> Self {
        Self {
            max_datagram_size,
            bytes_in_flight: 0,
            congestion_window: K_INITIAL_WINDOW_PACKETS * max_datagram_size,
            ssthresh: usize::MAX,
            recovery_start_time: None,
        }
    }

    #[inline]
    pub fn bytes_in_flight(&self) -> usize {
        self.bytes_in_flight
    }

    #[inline]
    pub fn congestion_window(&self) -> usize {
        self.congestion_window
    }

    #[inline]
    pub fn ssthresh(&self) -> usize {
        self.ssthresh
    }

    /// Congestion budget available for the next send pass.
    #[inline]
    pub fn available_window(&self) -> usize {
        self.congestion_window.saturating_sub(self.bytes_in_flight)
    }

    #[inline]
    pub fn in_slow_start(&self) -> bool {
        self.congestion_window < self.ssthresh
    }

    pub fn on_packet_sent(&mut self, sent_bytes: usize) {
        self.bytes_in_flight += sent_bytes;
    }

    /// A previously in-flight packet stopped counting (discarded with its
    /// epoch's keys).
    pub fn on_packet_discarded(&mut self, sent_bytes: usize) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(sent_bytes);
    }

    pub fn on_packet_acked(&mut self, sent_bytes: usize, sent_time: Timestamp) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(sent_bytes);

        //= https://www.rfc-editor.org/rfc/rfc9002#section-7.3.2
        //# While in congestion avoidance, acknowledgment of packets sent
        //# before the recovery period started does not change the
        //# congestion window.
        if let Some(recovery_start) = self.recovery_start_time {
            if sent_time <= recovery_start {
                return;
            }
        }

        if self.in_slow_start() {
            //= https://www.rfc-editor.org/rfc/rfc9002#section-7.3.1
            //# While a sender is in slow start, the congestion window
            //# increases by the number of bytes acknowledged
            self.congestion_window += sent_bytes;
        } else {
            //= https://www.rfc-editor.org/rfc/rfc9002#section-7.3.3
            //# limit the increase of the congestion window to one maximum
            //# datagram size for each congestion window that is acknowledged
            self.congestion_window +=
                self.max_datagram_size * sent_bytes / self.congestion_window;
        }
    }

    /// Packets were declared lost. `newest_lost_sent_time` is the send time
    /// of the most recently sent lost packet.
    pub fn on_packets_lost(
        &mut self,
        lost_bytes: usize,
        newest_lost_sent_time: Timestamp,
        now: Timestamp,
    ) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(lost_bytes);

        //= https://www.rfc-editor.org/rfc/rfc9002#section-7.3.2
        //# A recovery period ends and the sender enters congestion avoidance
        //# when a packet sent during the recovery period is acknowledged.
        let in_recovery = self
            .recovery_start_time
            .map_or(false, |start| newest_lost_sent_time <= start);
        if in_recovery {
            return;
        }

        self.recovery_start_time = Some(now);
        self.ssthresh = core::cmp::max(
            self.congestion_window / K_LOSS_REDUCTION_DIVISOR,
            K_MINIMUM_WINDOW_PACKETS * self.max_datagram_size,
        );
        self.congestion_window = self.ssthresh;
    }

    //= https://www.rfc-editor.org/rfc/rfc9002#section-7.6.2
    //# When persistent congestion is declared, the sender's congestion
    //# window MUST be reduced to the minimum congestion window
    pub fn on_persistent_congestion(&mut self) {
        self.congestion_window = K_MINIMUM_WINDOW_PACKETS * self.max_datagram_size;
        self.recovery_start_time = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;

    const MDS: usize = 1280;

    fn ts(ms: u64) -> Timestamp {
        Timestamp::from_duration(Duration::from_millis(ms))
    }

    #[test]
    fn slow_start_grows_by_bytes_acked() {
        let mut cc = CongestionController::new(MDS);
        assert_eq!(cc.congestion_window(), 10 * MDS);
        assert!(cc.in_slow_start());

        cc.on_packet_sent(1000);
        assert_eq!(cc.bytes_in_flight(), 1000);
        cc.on_packet_acked(1000, ts(10));
        assert_eq!(cc.bytes_in_flight(), 0);
        assert_eq!(cc.congestion_window(), 10 * MDS + 1000);
    }

    #[test]
    fn loss_halves_the_window_and_sets_ssthresh() {
        let mut cc = CongestionController::new(MDS);
        cc.on_packet_sent(5000);
        cc.on_packets_lost(5000, ts(10), ts(20));
        assert_eq!(cc.ssthresh(), 5 * MDS);
        assert_eq!(cc.congestion_window(), 5 * MDS);
        assert!(!cc.in_slow_start());
    }

    #[test]
    fn one_reduction_per_recovery_round() {
        let mut cc = CongestionController::new(MDS);
        cc.on_packet_sent(4000);
        cc.on_packets_lost(1000, ts(10), ts(20));
        let window = cc.congestion_window();
        // another loss from before the recovery point does not reduce again
        cc.on_packets_lost(1000, ts(15), ts(25));
        assert_eq!(cc.congestion_window(), window);
        // a loss sent after recovery started does
        cc.on_packets_lost(1000, ts(30), ts(40));
        assert!(cc.congestion_window() < window);
    }

    #[test]
    fn congestion_avoidance_grows_linearly() {
        let mut cc = CongestionController::new(MDS);
        cc.on_packet_sent(2 * MDS);
        cc.on_packets_lost(MDS, ts(10), ts(20));
        let window = cc.congestion_window();
        // ack sent after recovery start
        cc.on_packet_acked(MDS, ts(30));
        assert_eq!(cc.congestion_window(), window + MDS * MDS / window);
    }

    #[test]
    fn window_never_falls_below_the_floor() {
        let mut cc = CongestionController::new(MDS);
        for round in 0..10u64 {
            cc.on_packet_sent(100);
            cc.on_packets_lost(100, ts(100 * round + 50), ts(100 * round + 60));
        }
        assert!(cc.congestion_window() >= 2 * MDS);
        cc.on_persistent_congestion();
        assert_eq!(cc.congestion_window(), 2 * MDS);
    }
}
