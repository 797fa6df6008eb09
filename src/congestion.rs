//! Reno-style congestion window for one reliable channel.
//!
//! Two loss signals with different severities: an *accelerated* resend (a later
//!  packet's ack arrived first, so the packet was probably lost but the path is
//!  alive) takes a 3/4 soft backoff once enough of them accumulated, while a
//!  *timeout* resend (nothing came back at all) resets the window to the slow
//!  start floor. Window reductions are rate-limited to once per estimated RTT so
//!  a burst of losses from a single congestion event is charged only once.
//!
//! The backoff constants are tuned values, not derived ones.

use std::time::{Duration, Instant};

/// Numerator / denominator of the soft backoff.
const SOFT_BACKOFF_NUM: usize = 3;
const SOFT_BACKOFF_DEN: usize = 4;

pub struct CongestionWindow {
    window: usize,
    slow_start_threshold: usize,
    fragment_size: usize,
    /// `congestion_window_size` never goes below this.
    floor: usize,
    tolerance_loss_count: u32,
    accelerated_losses: u32,
    last_shrink: Option<Instant>,
}

impl CongestionWindow {
    pub fn new(fragment_size: usize, configured_minimum: usize, tolerance_loss_count: u32) -> CongestionWindow {
        // the floor must admit at least one physical packet, or a timeout
        //  reset would freeze pull-down and resends entirely
        let floor = if configured_minimum > 0 {
            configured_minimum.max(fragment_size)
        } else {
            fragment_size * 2
        };
        CongestionWindow {
            window: floor.max(fragment_size * 4),
            slow_start_threshold: usize::MAX,
            fragment_size,
            floor,
            tolerance_loss_count,
            accelerated_losses: 0,
            last_shrink: None,
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Called once per tick when the window was filled and acknowledgements
    ///  arrived: additive growth in slow start, `fragment²/window` in
    ///  congestion avoidance.
    pub fn on_window_filled_and_acked(&mut self) {
        if self.window < self.slow_start_threshold {
            self.window += self.fragment_size;
        } else {
            self.window += (self.fragment_size * self.fragment_size / self.window).max(1);
        }
    }

    /// A resend forced by a later packet's ack arriving first. Only shrinks after
    ///  `tolerance_loss_count` of these accumulated, so isolated reordering is
    ///  free.
    pub fn on_accelerated_resend(&mut self, now: Instant, estimated_rtt: Duration) {
        self.accelerated_losses += 1;
        if self.accelerated_losses <= self.tolerance_loss_count {
            return;
        }
        self.accelerated_losses = 0;

        if !self.shrink_allowed(now, estimated_rtt) {
            return;
        }
        self.window = (self.window * SOFT_BACKOFF_NUM / SOFT_BACKOFF_DEN).max(self.floor);
        self.slow_start_threshold = self.window;
        self.last_shrink = Some(now);
    }

    /// A resend forced by an outright timeout. Returns true when the window was
    ///  actually reset, so the caller can nudge its RTT estimate upward.
    pub fn on_timeout_resend(&mut self, now: Instant, estimated_rtt: Duration) -> bool {
        if !self.shrink_allowed(now, estimated_rtt) {
            return false;
        }
        self.slow_start_threshold = (self.window / 2).max(self.floor);
        self.window = self.floor;
        self.accelerated_losses = 0;
        self.last_shrink = Some(now);
        true
    }

    fn shrink_allowed(&self, now: Instant, estimated_rtt: Duration) -> bool {
        match self.last_shrink {
            Some(at) => now.duration_since(at) >= estimated_rtt,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAGMENT: usize = 512;
    const RTT: Duration = Duration::from_millis(100);

    fn window() -> CongestionWindow {
        CongestionWindow::new(FRAGMENT, 0, 2)
    }

    #[test]
    fn test_slow_start_grows_by_one_fragment() {
        let mut wnd = window();
        let initial = wnd.window();
        wnd.on_window_filled_and_acked();
        assert_eq!(wnd.window(), initial + FRAGMENT);
    }

    #[test]
    fn test_avoidance_grows_sublinearly() {
        let mut wnd = window();

        // a timeout reset leaves the window at or above the new threshold, so
        //  every growth step from here is congestion avoidance
        assert!(wnd.on_timeout_resend(Instant::now(), RTT));
        assert!(wnd.window() >= wnd.slow_start_threshold);

        let before = wnd.window();
        wnd.on_window_filled_and_acked();
        let grown = wnd.window() - before;

        assert!(grown >= 1);
        assert!(grown < FRAGMENT, "avoidance growth {} should be below one fragment", grown);
    }

    #[test]
    fn test_accelerated_resends_are_tolerated_then_shrink() {
        let mut wnd = window();
        for _ in 0..5 {
            wnd.on_window_filled_and_acked();
        }
        let now = Instant::now();
        let before = wnd.window();

        // first two are within tolerance
        wnd.on_accelerated_resend(now, RTT);
        wnd.on_accelerated_resend(now, RTT);
        assert_eq!(wnd.window(), before);

        // the third shrinks to 3/4
        wnd.on_accelerated_resend(now, RTT);
        assert_eq!(wnd.window(), before * 3 / 4);
    }

    #[test]
    fn test_timeout_resets_to_floor() {
        let mut wnd = window();
        for _ in 0..20 {
            wnd.on_window_filled_and_acked();
        }
        assert!(wnd.on_timeout_resend(Instant::now(), RTT));
        assert_eq!(wnd.window(), FRAGMENT * 2);
    }

    #[test]
    fn test_shrink_rate_limited_to_once_per_rtt() {
        let mut wnd = window();
        for _ in 0..20 {
            wnd.on_window_filled_and_acked();
        }
        let now = Instant::now();
        assert!(wnd.on_timeout_resend(now, RTT));
        // immediately after, a second timeout must not reset again
        assert!(!wnd.on_timeout_resend(now + Duration::from_millis(10), RTT));
        // but after a full RTT it may
        assert!(wnd.on_timeout_resend(now + RTT, RTT));
    }

    #[test]
    fn test_floor_below_fragment_size_still_admits_one_packet() {
        let mut wnd = CongestionWindow::new(FRAGMENT, FRAGMENT / 4, 0);
        assert!(wnd.on_timeout_resend(Instant::now(), RTT));
        assert!(wnd.window() >= FRAGMENT);
    }

    #[test]
    fn test_window_never_below_floor() {
        let mut wnd = CongestionWindow::new(FRAGMENT, 3 * FRAGMENT, 0);
        let mut now = Instant::now();
        for _ in 0..50 {
            now += RTT;
            wnd.on_timeout_resend(now, RTT);
            wnd.on_accelerated_resend(now, RTT);
            assert!(wnd.window() >= 3 * FRAGMENT);
        }
    }
}
