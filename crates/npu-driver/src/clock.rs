//! Time source and delay primitive used by every polling loop

use crate::error::{NpuError, Result};
use std::time::{Duration, Instant};

/// Monotonic microsecond clock with a blocking delay.
pub trait Clock {
    /// Microseconds since an arbitrary fixed origin.
    fn now_us(&self) -> u64;

    /// Block for `us` microseconds.
    fn delay_us(&mut self, us: u64);

    /// Block for `ms` milliseconds.
    fn delay_ms(&mut self, ms: u64) {
        self.delay_us(ms.saturating_mul(1000));
    }
}

/// Wall clock backed by [`Instant`] and [`std::thread::sleep`]
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Clock whose origin is now
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    #[allow(clippy::cast_possible_truncation)]
    fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }

    fn delay_us(&mut self, us: u64) {
        std::thread::sleep(Duration::from_micros(us));
    }
}

/// Call `probe` every `interval_us` until it yields a result.
///
/// `timeout_us == 0` polls forever. Otherwise the probe runs at least once and
/// [`NpuError::Timeout`] is returned once `timeout_us` has elapsed.
pub(crate) fn poll<C, T>(
    clock: &mut C,
    interval_us: u64,
    timeout_us: u64,
    mut probe: impl FnMut() -> Option<Result<T>>,
) -> Result<T>
where
    C: Clock + ?Sized,
{
    let start = clock.now_us();
    loop {
        if let Some(result) = probe() {
            return result;
        }
        if timeout_us != 0 && clock.now_us().saturating_sub(start) >= timeout_us {
            return Err(NpuError::Timeout {
                duration_us: timeout_us,
            });
        }
        clock.delay_us(interval_us);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimClock;

    #[test]
    fn poll_times_out_at_deadline() {
        let mut clock = SimClock::new();
        let mut probes = 0;
        let result: Result<()> = poll(&mut clock, 10, 1000, || {
            probes += 1;
            None
        });
        assert!(matches!(result, Err(NpuError::Timeout { duration_us: 1000 })));
        assert_eq!(clock.now_us(), 1000);
        assert_eq!(probes, 101);
    }

    #[test]
    fn poll_returns_first_result() {
        let mut clock = SimClock::new();
        let mut probes = 0;
        let value = poll(&mut clock, 10, 0, || {
            probes += 1;
            (probes == 5).then_some(Ok(probes))
        })
        .unwrap();
        assert_eq!(value, 5);
        assert_eq!(clock.now_us(), 40);
    }

    #[test]
    fn system_clock_advances_across_delay() {
        let mut clock = SystemClock::new();
        let before = clock.now_us();
        clock.delay_us(200);
        assert!(clock.now_us() >= before + 200);
    }
}
