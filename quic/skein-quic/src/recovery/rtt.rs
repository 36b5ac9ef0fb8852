// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::cmp::{max, min};
use core::time::Duration;

//= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.2
//# When no previous RTT is available, the initial RTT
//# SHOULD be set to 333 milliseconds.
pub const K_INITIAL_RTT: Duration = Duration::from_millis(333);

//= https://www.rfc-editor.org/rfc/rfc9002#section-6.1.2
//# The RECOMMENDED value of the timer granularity (kGranularity) is 1
//# millisecond.
pub const K_GRANULARITY: Duration = Duration::from_millis(1);

/// Round-trip estimator per RFC 9002 section 5.
#[derive(Clone, Copy, Debug)]
pub struct RttEstimator {
    latest_rtt: Duration,
    min_rtt: Duration,
    smoothed_rtt: Duration,
    rttvar: Duration,
    /// The peer's max_ack_delay transport parameter.
    max_ack_delay: Duration,
    has_sample: bool,
}

impl Default for RttEstimator {
    fn default() -> Self {
        //= https://www.rfc-editor.org/rfc/rfc9002#section-5.3
        //# smoothed_rtt = kInitialRtt
        //# rttvar = kInitialRtt / 2
        Self {
            latest_rtt: K_INITIAL_RTT,
            min_rtt: K_INITIAL_RTT,
            smoothed_rtt: K_INITIAL_RTT,
            rttvar: K_INITIAL_RTT / 2,
            max_ack_delay: Duration::from_millis(25),
            has_sample: false,
        }
    }
}

impl RttEstimator {
    #[inline]
    pub fn latest_rtt(&self) -> Duration {
        self.latest_rtt
    }

    #[inline]
    pub fn smoothed_rtt(&self) -> Duration {
        self.smoothed_rtt
    }

    #[inline]
    pub fn min_rtt(&self) -> Duration {
        self.min_rtt
    }

    #[inline]
    pub fn rttvar(&self) -> Duration {
        self.rttvar
    }

    #[inline]
    pub fn max_ack_delay(&self) -> Duration {
        self.max_ack_delay
    }

    #[inline]
    pub fn has_sample(&self) -> bool {
        self.has_sample
    }

    pub fn set_max_ack_delay(&mut self, max_ack_delay: Duration) {
        self.max_ack_delay = max_ack_delay;
    }

    /// Feeds a sample taken from an ACK that newly acknowledged the largest
    /// packet.
    pub fn update(
        &mut self,
        rtt_sample: Duration,
        mut ack_delay: Duration,
        handshake_confirmed: bool,
    ) {
        self.latest_rtt = max(rtt_sample, Duration::from_micros(1));

        //= https://www.rfc-editor.org/rfc/rfc9002#section-5.2
        //# min_rtt MUST be set to the latest_rtt on the first RTT sample.
        if !self.has_sample {
            self.has_sample = true;
            self.min_rtt = self.latest_rtt;
            self.smoothed_rtt = self.latest_rtt;
            self.rttvar = self.latest_rtt / 2;
            return;
        }

        self.min_rtt = min(self.min_rtt, self.latest_rtt);

        //= https://www.rfc-editor.org/rfc/rfc9002#section-5.3
        //# *  MUST use the lesser of the acknowledgment delay and the peer's
        //#    max_ack_delay after the handshake is confirmed
        if handshake_confirmed {
            ack_delay = min(ack_delay, self.max_ack_delay);
        }

        //= https://www.rfc-editor.org/rfc/rfc9002#section-5.3
        //# *  MUST NOT subtract the acknowledgment delay from the RTT sample if
        //#    the resulting value is smaller than the min_rtt.
        let mut adjusted_rtt = self.latest_rtt;
        if self.min_rtt + ack_delay < self.latest_rtt {
            adjusted_rtt -= ack_delay;
        }

        //= https://www.rfc-editor.org/rfc/rfc9002#section-5.3
        //# smoothed_rtt = 7/8 * smoothed_rtt + 1/8 * adjusted_rtt
        //# rttvar_sample = abs(smoothed_rtt - adjusted_rtt)
        //# rttvar = 3/4 * rttvar + 1/4 * rttvar_sample
        let rttvar_sample = if self.smoothed_rtt > adjusted_rtt {
            self.smoothed_rtt - adjusted_rtt
        } else {
            adjusted_rtt - self.smoothed_rtt
        };
        self.rttvar = (self.rttvar * 3 + rttvar_sample) / 4;
        self.smoothed_rtt = (self.smoothed_rtt * 7 + adjusted_rtt) / 8;
    }

    //= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.1
    //# PTO = smoothed_rtt + max(4*rttvar, kGranularity) + max_ack_delay
    /// One PTO period, before backoff.
    ///
    /// `include_max_ack_delay` is false for the Initial and Handshake
    /// spaces, whose acknowledgments the peer does not delay.
    pub fn pto_period(&self, include_max_ack_delay: bool) -> Duration {
        let mut period = self.smoothed_rtt + max(self.rttvar * 4, K_GRANULARITY);
        if include_max_ack_delay {
            period += self.max_ack_delay;
        }
        period
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: u64 = 1;
    fn ms(v: u64) -> Duration {
        Duration::from_millis(v * MS)
    }

    #[test]
    fn first_sample_seeds_the_estimator() {
        let mut rtt = RttEstimator::default();
        rtt.update(ms(100), ms(5), false);
        assert_eq!(rtt.latest_rtt(), ms(100));
        assert_eq!(rtt.min_rtt(), ms(100));
        assert_eq!(rtt.smoothed_rtt(), ms(100));
        assert_eq!(rtt.rttvar(), ms(50));
    }

    #[test]
    fn ewma_follows_rfc_weights() {
        let mut rtt = RttEstimator::default();
        rtt.update(ms(100), Duration::ZERO, false);
        rtt.update(ms(200), Duration::ZERO, false);
        // smoothed = 7/8*100 + 1/8*200 = 112.5ms
        assert_eq!(rtt.smoothed_rtt(), Duration::from_micros(112_500));
        // rttvar = 3/4*50 + 1/4*|100-200| = 62.5ms
        assert_eq!(rtt.rttvar(), Duration::from_micros(62_500));
        assert_eq!(rtt.min_rtt(), ms(100));
    }

    #[test]
    fn ack_delay_is_bounded_after_confirmation() {
        let mut rtt = RttEstimator::default();
        rtt.set_max_ack_delay(ms(25));
        rtt.update(ms(100), Duration::ZERO, true);
        // a huge reported delay is clamped to max_ack_delay
        rtt.update(ms(300), ms(250), true);
        // adjusted = 300 - 25 = 275
        assert_eq!(
            rtt.smoothed_rtt(),
            (ms(100) * 7 + ms(275)) / 8
        );
    }

    #[test]
    fn ack_delay_never_pushes_below_min_rtt() {
        let mut rtt = RttEstimator::default();
        rtt.update(ms(100), Duration::ZERO, false);
        // 105 - 10 would fall below min_rtt; the sample is used unadjusted
        rtt.update(ms(105), ms(10), false);
        assert_eq!(rtt.smoothed_rtt(), (ms(100) * 7 + ms(105)) / 8);
    }

    #[test]
    fn pto_includes_max_ack_delay_only_for_application_space() {
        let mut rtt = RttEstimator::default();
        rtt.set_max_ack_delay(ms(25));
        rtt.update(ms(40), Duration::ZERO, true);
        let base = rtt.pto_period(false);
        assert_eq!(rtt.pto_period(true), base + ms(25));
        assert!(base >= rtt.smoothed_rtt() + K_GRANULARITY);
    }
}
