use std::time::Instant;

/// Kinds of timeouts a connection may need to wait on
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Timer {
    /// When to send an ack-eliciting probe packet or declare unacked packets lost
    LossDetection = 0,
    /// When to close the connection after no activity
    Idle = 1,
    /// When the close timer expires, the draining period has passed and the
    /// connection may be discarded
    Close = 2,
    /// When to give up on validating the peer's new address
    PathValidation = 3,
    /// When to send a `PING` frame to keep the connection alive
    KeepAlive = 4,
    /// When pacing will allow another packet to be sent
    Pacing = 5,
    /// When an ack must be sent even though the threshold hasn't been reached
    MaxAckDelay = 6,
}

impl Timer {
    pub(crate) const VALUES: [Self; 7] = [
        Self::LossDetection,
        Self::Idle,
        Self::Close,
        Self::PathValidation,
        Self::KeepAlive,
        Self::Pacing,
        Self::MaxAckDelay,
    ];
}

/// A table of data associated with each distinct kind of `Timer`
#[derive(Debug, Copy, Clone, Default)]
pub(crate) struct TimerTable {
    data: [Option<Instant>; 7],
}

impl TimerTable {
    pub(crate) fn set(&mut self, timer: Timer, time: Instant) {
        self.data[timer as usize] = Some(time);
    }

    pub(crate) fn get(&self, timer: Timer) -> Option<Instant> {
        self.data[timer as usize]
    }

    pub(crate) fn stop(&mut self, timer: Timer) {
        self.data[timer as usize] = None;
    }

    /// The next timeout across all timers, if any is armed
    pub(crate) fn next_timeout(&self) -> Option<Instant> {
        self.data.iter().filter_map(|&x| x).min()
    }

    /// Whether `timer` is armed and has expired as of `after`
    pub(crate) fn is_expired(&self, timer: Timer, after: Instant) -> bool {
        self.data[timer as usize].is_some_and(|x| x <= after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn min_across_timers() {
        let now = Instant::now();
        let mut table = TimerTable::default();
        assert_eq!(table.next_timeout(), None);
        table.set(Timer::Idle, now + Duration::from_secs(30));
        table.set(Timer::LossDetection, now + Duration::from_millis(50));
        assert_eq!(table.next_timeout(), Some(now + Duration::from_millis(50)));
        table.stop(Timer::LossDetection);
        assert_eq!(table.next_timeout(), Some(now + Duration::from_secs(30)));
    }

    #[test]
    fn expiry() {
        let now = Instant::now();
        let mut table = TimerTable::default();
        table.set(Timer::Idle, now);
        assert!(table.is_expired(Timer::Idle, now));
        assert!(!table.is_expired(Timer::Close, now));
    }
}
