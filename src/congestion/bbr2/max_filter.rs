use std::collections::VecDeque;

/// Running maximum over a sliding window of virtual time
///
/// Indices are an arbitrary monotonic counter (round trips, probe cycles). Samples
/// older than `window` indices fall out of the maximum. Implemented as a monotonic
/// deque, so both update and query are amortized constant time.
#[derive(Debug, Clone)]
pub(super) struct WindowedMaxFilter {
    window: u64,
    /// Non-increasing values with their indices, newest at the back
    samples: VecDeque<(u64, u64)>,
}

impl WindowedMaxFilter {
    pub(super) fn new(window: u64) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    pub(super) fn update(&mut self, index: u64, value: u64) {
        while let Some(&(_, back)) = self.samples.back() {
            if back > value {
                break;
            }
            self.samples.pop_back();
        }
        self.samples.push_back((index, value));
        self.expire(index);
    }

    /// Drop samples that have left the window as of `index`
    pub(super) fn expire(&mut self, index: u64) {
        while let Some(&(front_index, _)) = self.samples.front() {
            if front_index + self.window > index {
                break;
            }
            self.samples.pop_front();
        }
    }

    pub(super) fn get(&self) -> u64 {
        self.samples.front().map_or(0, |&(_, value)| value)
    }

    pub(super) fn reset(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_max() {
        let mut filter = WindowedMaxFilter::new(2);
        filter.update(0, 10);
        assert_eq!(filter.get(), 10);
        filter.update(0, 5);
        assert_eq!(filter.get(), 10);
        filter.update(1, 20);
        assert_eq!(filter.get(), 20);
    }

    #[test]
    fn expires_old_samples() {
        let mut filter = WindowedMaxFilter::new(2);
        filter.update(0, 100);
        filter.update(1, 10);
        assert_eq!(filter.get(), 100);
        filter.update(2, 10);
        // The sample from index 0 is now outside the 2-wide window
        assert_eq!(filter.get(), 10);
    }

    #[test]
    fn reset_clears() {
        let mut filter = WindowedMaxFilter::new(2);
        filter.update(0, 42);
        filter.reset();
        assert_eq!(filter.get(), 0);
    }
}
