//! Interval boundary computation.
//!
//! Interval timestamps are aligned multiples of the interval length, so
//! independently restarted instances produce comparable series. The wall
//! clock drives boundaries from system time; the trace clock derives them
//! from observation timestamps during replay.

use std::time::{Duration, SystemTime};

/// Aligned interval arithmetic shared by both clock flavors.
#[derive(Debug, Clone, Copy)]
pub struct IntervalClock {
    interval_secs: u32,
}

impl IntervalClock {
    pub fn new(interval: Duration) -> Self {
        IntervalClock {
            interval_secs: interval.as_secs().max(1) as u32,
        }
    }

    pub fn interval_secs(&self) -> u32 {
        self.interval_secs
    }

    /// The aligned start of the interval containing `ts`.
    pub fn floor(&self, ts: u32) -> u32 {
        ts - (ts % self.interval_secs)
    }

    /// The aligned start of the interval after the one containing `ts`.
    pub fn next_boundary(&self, ts: u32) -> u32 {
        self.floor(ts) + self.interval_secs
    }

    /// Seconds since the epoch, for wall-clock ticking.
    pub fn now(&self) -> u32 {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs() as u32
    }
}

/// Derives interval boundaries from a monotonically advancing stream of
/// observation timestamps.
#[derive(Debug)]
pub struct TraceClock {
    clock: IntervalClock,
    current: Option<u32>,
}

impl TraceClock {
    pub fn new(interval: Duration) -> Self {
        TraceClock {
            clock: IntervalClock::new(interval),
            current: None,
        }
    }

    /// The aligned start of the interval currently accumulating.
    pub fn current(&self) -> Option<u32> {
        self.current
    }

    /// Feeds the next observation timestamp. Returns the aligned start of
    /// every interval that ended before `ts`, oldest first; timestamps
    /// that jump several intervals ahead end each one in turn.
    pub fn advance(&mut self, ts: u32) -> Vec<u32> {
        let target = self.clock.floor(ts);
        let mut ended = Vec::new();

        match self.current {
            None => {
                self.current = Some(target);
            }
            Some(current) if target > current => {
                let mut boundary = current;
                while boundary < target {
                    ended.push(boundary);
                    boundary += self.clock.interval_secs();
                }
                self.current = Some(target);
            }
            // Late or in-interval timestamps do not move the clock.
            Some(_) => {}
        }

        ended
    }

    /// The interval accumulating at end of stream, if any packet arrived.
    pub fn finish(&mut self) -> Option<u32> {
        self.current.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floor_alignment() {
        let clock = IntervalClock::new(Duration::from_secs(60));
        assert_eq!(clock.floor(0), 0);
        assert_eq!(clock.floor(59), 0);
        assert_eq!(clock.floor(60), 60);
        assert_eq!(clock.floor(1000), 960);
    }

    #[test]
    fn test_next_boundary() {
        let clock = IntervalClock::new(Duration::from_secs(60));
        assert_eq!(clock.next_boundary(0), 60);
        assert_eq!(clock.next_boundary(61), 120);
    }

    #[test]
    fn test_trace_clock_first_packet_opens_interval() {
        let mut clock = TraceClock::new(Duration::from_secs(60));
        assert!(clock.advance(125).is_empty());
        assert_eq!(clock.current(), Some(120));
    }

    #[test]
    fn test_trace_clock_ends_interval_on_crossing() {
        let mut clock = TraceClock::new(Duration::from_secs(60));
        clock.advance(100);
        assert!(clock.advance(119).is_empty());
        assert_eq!(clock.advance(121), vec![60]);
        assert_eq!(clock.current(), Some(120));
    }

    #[test]
    fn test_trace_clock_multi_interval_jump() {
        let mut clock = TraceClock::new(Duration::from_secs(60));
        clock.advance(10);
        // Jump over three full intervals.
        assert_eq!(clock.advance(195), vec![0, 60, 120]);
        assert_eq!(clock.current(), Some(180));
    }

    #[test]
    fn test_trace_clock_ignores_late_timestamps() {
        let mut clock = TraceClock::new(Duration::from_secs(60));
        clock.advance(130);
        assert!(clock.advance(65).is_empty());
        assert_eq!(clock.current(), Some(120));
    }

    #[test]
    fn test_trace_clock_finish() {
        let mut clock = TraceClock::new(Duration::from_secs(60));
        assert_eq!(clock.finish(), None);
        clock.advance(70);
        assert_eq!(clock.finish(), Some(60));
        assert_eq!(clock.finish(), None);
    }
}
