use embedded_hal::blocking::delay::{DelayMs, DelayUs};
use embedded_hal::watchdog::Watchdog;

use crate::error::Error;
use crate::hal::{CaptureTimer, Comparator, ProbePort};
use crate::tester::Tester;

/// Upper bound of polls while waiting for a capture.
const MAX_POLLS: u32 = 4_000_000;

/// Combines a 16-bit capture with the overflow count into a tick count.
///
/// An overflow that happened before the capture but was not serviced yet
/// shows up as a pending flag together with a captured value in the lower
/// half of the range.
///
/// # Examples
///
/// ```
/// use component_tester::reconcile;
///
/// assert_eq!(reconcile(0x1234, 2, false), 0x0002_1234);
/// assert_eq!(reconcile(0x0010, 2, true), 0x0003_0010);
/// assert_eq!(reconcile(0xfff0, 2, true), 0x0002_fff0);
/// ```
pub fn reconcile(captured: u16, overflows: u32, pending: bool) -> u32 {
    let overflows = if pending && captured < 0x8000 {
        overflows + 1
    } else {
        overflows
    };

    overflows << 16 | captured as u32
}

impl<P, C, T, D, W> Tester<P, C, T, D, W>
where
    P: ProbePort,
    C: Comparator,
    T: CaptureTimer,
    D: DelayMs<u16> + DelayUs<u16>,
    W: Watchdog,
{
    /// Polls the running capture timer and returns the ticks until the
    /// comparator fired, or [`Error::TooHigh`] after `overflow_limit`
    /// overflows.
    pub(crate) fn wait_for_capture(&mut self, overflow_limit: u32) -> Result<u32, Error<P::Error>> {
        for _ in 0..MAX_POLLS {
            self.feed();

            if let Some(captured) = self.timer.capture() {
                let ticks = reconcile(
                    captured,
                    self.timer.overflows(),
                    self.timer.overflow_pending(),
                );
                self.timer.stop();
                return Ok(ticks);
            }

            if self.timer.overflows() > overflow_limit {
                break;
            }
        }

        self.timer.stop();
        Err(Error::TooHigh)
    }
}
