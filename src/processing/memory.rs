//! Bounding the number of decoded images alive at once

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

/// Counting gate for decoded pixel buffers.
///
/// A worker acquires a permit before decoding and keeps it until the encoded
/// bytes are written, so at most `permits` full-resolution buffers exist at
/// any moment no matter how work is scheduled.
#[derive(Debug)]
pub struct DecodeBudget {
    permits: usize,
    in_use: Mutex<usize>,
    released: Condvar,
    peak: AtomicUsize,
}

impl DecodeBudget {
    /// Create a budget allowing `permits` concurrent decodes (at least one)
    pub fn new(permits: usize) -> Arc<Self> {
        Arc::new(Self {
            permits: permits.max(1),
            in_use: Mutex::new(0),
            released: Condvar::new(),
            peak: AtomicUsize::new(0),
        })
    }

    /// Block until a permit is free
    pub fn acquire(self: &Arc<Self>) -> BudgetPermit {
        let mut in_use = self.in_use.lock();
        while *in_use >= self.permits {
            trace!("Decode budget exhausted, waiting");
            self.released.wait(&mut in_use);
        }
        *in_use += 1;
        self.peak.fetch_max(*in_use, Ordering::AcqRel);

        BudgetPermit {
            budget: Arc::clone(self),
        }
    }

    /// Take a permit only if one is free right now
    pub fn try_acquire(self: &Arc<Self>) -> Option<BudgetPermit> {
        let mut in_use = self.in_use.lock();
        if *in_use >= self.permits {
            return None;
        }
        *in_use += 1;
        self.peak.fetch_max(*in_use, Ordering::AcqRel);

        Some(BudgetPermit {
            budget: Arc::clone(self),
        })
    }

    fn release(&self) {
        let mut in_use = self.in_use.lock();
        *in_use = in_use.saturating_sub(1);
        self.released.notify_one();
    }

    pub fn permits(&self) -> usize {
        self.permits
    }

    /// Permits currently held
    pub fn in_use(&self) -> usize {
        *self.in_use.lock()
    }

    /// Highest number of permits ever held at the same time
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }
}

/// RAII permit; dropping it lets the next decode start
#[derive(Debug)]
pub struct BudgetPermit {
    budget: Arc<DecodeBudget>,
}

impl Drop for BudgetPermit {
    fn drop(&mut self) {
        self.budget.release();
    }
}

/// Approximate memory held by a decoded buffer, for log output
pub fn decoded_size_estimate(width: u32, height: u32, bytes_per_pixel: u8) -> u64 {
    let estimate = u64::from(width) * u64::from(height) * u64::from(bytes_per_pixel);
    debug!(
        "Decoded buffer estimate: {:.1}MB for {}x{}",
        estimate as f64 / 1024.0 / 1024.0,
        width,
        height
    );
    estimate
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_permit_is_returned_on_drop() {
        let budget = DecodeBudget::new(2);

        {
            let _first = budget.acquire();
            let _second = budget.acquire();
            assert_eq!(budget.in_use(), 2);
            assert!(budget.try_acquire().is_none());
        }

        assert_eq!(budget.in_use(), 0);
        assert_eq!(budget.peak(), 2);
        assert!(budget.try_acquire().is_some());
    }

    #[test]
    fn test_zero_permits_is_clamped() {
        let budget = DecodeBudget::new(0);
        assert_eq!(budget.permits(), 1);
        let _permit = budget.acquire();
    }

    #[test]
    fn test_concurrent_holders_never_exceed_permits() {
        let budget = DecodeBudget::new(3);

        thread::scope(|scope| {
            for _ in 0..12 {
                let budget = Arc::clone(&budget);
                scope.spawn(move || {
                    let _permit = budget.acquire();
                    assert!(budget.in_use() <= 3);
                    thread::sleep(Duration::from_millis(5));
                });
            }
        });

        assert!(budget.peak() <= 3);
        assert!(budget.peak() >= 1);
        assert_eq!(budget.in_use(), 0);
    }

    #[test]
    fn test_size_estimate() {
        assert_eq!(decoded_size_estimate(100, 50, 4), 20_000);
    }
}
