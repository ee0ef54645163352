//! Hardware seams of the tester.
//!
//! Delays and the watchdog come from `embedded-hal`; the probe port, the
//! analog comparator and the capture timer are specific to this instrument.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::probe::{Probe, ProbeConfig};

/// Reference voltage of a single ADC conversion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reference {
    /// The supply voltage, full scale at `Config::vcc_mv`.
    Supply,
    /// The internal bandgap, full scale at `Config::bandgap_mv`.
    Bandgap,
}

/// The three probe pins, their resistor pins and the ADC behind them.
pub trait ProbePort {
    type Error;

    /// Applies the modes of all three probes as one snapshot.
    fn configure(&mut self, config: &ProbeConfig) -> Result<(), Self::Error>;

    /// Performs one conversion of `probe` against `reference`, returning the
    /// raw ADC code.
    fn convert(&mut self, probe: Probe, reference: Reference) -> nb::Result<u16, Self::Error>;
}

/// The analog comparator, with the bandgap on its positive input.
pub trait Comparator {
    /// Routes `probe` to the negative input and arms the capture trigger.
    fn select(&mut self, probe: Probe);

    /// Returns `true` while the selected probe is above the bandgap.
    fn is_above_reference(&mut self) -> bool;

    fn disable(&mut self);
}

/// A 16-bit timer whose input capture is triggered by the comparator.
pub trait CaptureTimer {
    /// Clears the counter, the overflow counter and any stale capture, then
    /// starts counting.
    fn start(&mut self);

    fn stop(&mut self);

    /// Returns the captured counter value once a capture happened.
    fn capture(&mut self) -> Option<u16>;

    /// Number of overflows serviced so far.
    fn overflows(&self) -> u32;

    /// Returns `true` if an overflow occurred that was not serviced yet.
    fn overflow_pending(&self) -> bool;
}

/// Overflow counter shared between a timer's overflow interrupt and the
/// measurement routines.
///
/// # Examples
///
/// ```
/// use component_tester::OverflowCounter;
///
/// static OVERFLOWS: OverflowCounter = OverflowCounter::new();
///
/// // in the overflow interrupt handler
/// OVERFLOWS.increment();
///
/// assert_eq!(OVERFLOWS.get(), 1);
/// ```
#[derive(Debug, Default)]
pub struct OverflowCounter(AtomicU32);

impl OverflowCounter {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::Release);
    }
}
