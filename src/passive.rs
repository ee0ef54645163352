//! Two-terminal tests: resistors and diodes between an ordered probe pair.

use embedded_hal::blocking::delay::{DelayMs, DelayUs};
use embedded_hal::watchdog::Watchdog;

use crate::error::Error;
use crate::hal::{CaptureTimer, Comparator, ProbePort};
use crate::probe::{Probe, ProbeConfig, ProbeMode};
use crate::session::{ClassificationSession, DiodeRecord};
use crate::tester::Tester;
use crate::units::Scaled;

/// Smallest usable voltage of a divider reading (mV).
const MIN_DIVIDER_MV: u16 = 5;
/// Divider estimates coarser than this relative error are ignored.
const MAX_RELATIVE_ERROR: f32 = 0.25;
/// Estimates of one resistor may differ by this factor at most.
const MAX_SPREAD: f32 = 2.0;

const DIODE_MIN_MV: u16 = 150;
const DIODE_MAX_MV: u16 = 4640;
const DIODE_MAX_RATIO: u32 = 8;

/// Voltages at the two ends of the part for one probe configuration.
#[derive(Clone, Copy, Debug)]
struct Divider {
    high: u16,
    low: u16,
}

impl Divider {
    fn across(&self) -> u16 {
        self.high.saturating_sub(self.low)
    }
}

/// Which resistor sits in series with the part, and on which side.
#[derive(Clone, Copy, Debug)]
enum Leg {
    LowUp,
    LowDown,
    HighUp,
    HighDown,
}

impl Leg {
    const ALL: [Leg; 4] = [Leg::LowUp, Leg::LowDown, Leg::HighUp, Leg::HighDown];

    fn config(self, a: Probe, b: Probe) -> ProbeConfig {
        let (mode_a, mode_b) = match self {
            Leg::LowUp => (ProbeMode::PullUpLow, ProbeMode::DriveLow),
            Leg::LowDown => (ProbeMode::DriveHigh, ProbeMode::PullDownLow),
            Leg::HighUp => (ProbeMode::PullUpHigh, ProbeMode::DriveLow),
            Leg::HighDown => (ProbeMode::DriveHigh, ProbeMode::PullDownHigh),
        };

        ProbeConfig::NEUTRAL.with(a, mode_a).with(b, mode_b)
    }

    fn settle_ms(self) -> u16 {
        match self {
            Leg::LowUp | Leg::LowDown => 5,
            Leg::HighUp | Leg::HighDown => 20,
        }
    }
}

/// A resistance estimate (Ω) and its weight.
#[derive(Clone, Copy, Debug)]
struct Estimate {
    ohms: f32,
    weight: f32,
}

impl<P, C, T, D, W> Tester<P, C, T, D, W>
where
    P: ProbePort,
    C: Comparator,
    T: CaptureTimer,
    D: DelayMs<u16> + DelayUs<u16>,
    W: Watchdog,
{
    fn divider(
        &mut self,
        config: ProbeConfig,
        a: Probe,
        b: Probe,
        ms: u16,
    ) -> Result<Divider, Error<P::Error>> {
        self.apply(config)?;
        self.wait_ms(ms);

        Ok(Divider {
            high: self.voltage(a)?,
            low: self.voltage(b)?,
        })
    }

    /// Quantisation step (mV) of a reading, finer below the bandgap.
    fn resolution(&self, mv: u16) -> f32 {
        let full_scale = if (mv as u32) < self.bandgap_mv() {
            self.bandgap_mv() as f32
        } else {
            self.config.vcc_mv as f32
        };

        full_scale / self.config.adc_range as f32
    }

    fn estimate(&self, leg: Leg, reading: Divider) -> Option<Estimate> {
        let (mode, known_mv, known_at) = match leg {
            Leg::LowUp => (
                ProbeMode::PullUpLow,
                self.config.vcc_mv.saturating_sub(reading.high),
                reading.high,
            ),
            Leg::LowDown => (ProbeMode::PullDownLow, reading.low, reading.low),
            Leg::HighUp => (
                ProbeMode::PullUpHigh,
                self.config.vcc_mv.saturating_sub(reading.high),
                reading.high,
            ),
            Leg::HighDown => (ProbeMode::PullDownHigh, reading.low, reading.low),
        };
        let known_ohms = self.series_ohms(mode) as f32;
        let across = reading.across();

        if known_mv < MIN_DIVIDER_MV || across < MIN_DIVIDER_MV {
            return None;
        }

        let across_step = self.resolution(reading.high);
        let relative_error =
            across_step / across as f32 + self.resolution(known_at) / known_mv as f32;

        if relative_error > MAX_RELATIVE_ERROR {
            return None;
        }

        Some(Estimate {
            ohms: known_ohms * across as f32 / known_mv as f32,
            weight: 1.0 / (relative_error * relative_error),
        })
    }

    /// Measures the resistance from `a`, pulled up, to `b`. Returns `None`
    /// when the part does not behave like a resistor.
    pub(crate) fn measure_resistance(
        &mut self,
        a: Probe,
        b: Probe,
    ) -> Result<Option<Scaled>, Error<P::Error>> {
        let first = self.divider(Leg::LowUp.config(a, b), a, b, Leg::LowUp.settle_ms())?;
        if self.config.vcc_mv.saturating_sub(first.high) < MIN_DIVIDER_MV {
            return Ok(None);
        }

        // a capacitor keeps charging through Rh
        self.apply(Leg::HighUp.config(a, b))?;
        self.wait_ms(1);
        let start = self.voltage(a)?;
        self.wait_ms(20);
        let end = self.voltage(a)?;
        if !is_stable(start, end) {
            tracing::trace!(%a, %b, start, end, "charging, not resistive");
            return Ok(None);
        }

        let mut estimates = [None; 4];
        for (estimate, leg) in estimates.iter_mut().zip(Leg::ALL) {
            let reading = self.divider(leg.config(a, b), a, b, leg.settle_ms())?;
            *estimate = self.estimate(leg, reading);
        }

        let last = self.divider(Leg::LowUp.config(a, b), a, b, Leg::LowUp.settle_ms())?;
        if !is_stable(first.high, last.high) {
            tracing::trace!(%a, %b, "divider drifts, not resistive");
            return Ok(None);
        }

        let valid = estimates.iter().flatten();
        let (mut smallest, mut largest) = (f32::MAX, 0.0f32);
        let (mut sum, mut weights) = (0.0f32, 0.0f32);

        for estimate in valid {
            if estimate.ohms < smallest {
                smallest = estimate.ohms;
            }
            if estimate.ohms > largest {
                largest = estimate.ohms;
            }
            sum += estimate.ohms * estimate.weight;
            weights += estimate.weight;
        }

        if weights == 0.0 {
            return Ok(None);
        }
        if largest > smallest * MAX_SPREAD {
            tracing::trace!(%a, %b, smallest, largest, "estimates disagree");
            return Ok(None);
        }

        let centiohms = (sum / weights * 100.0 + 0.5) as u64;
        let value = Scaled::from_wide(centiohms.saturating_sub(self.calibration.r_zero as u64), -2);
        tracing::debug!(%a, %b, %value, "resistance");

        Ok(Some(value))
    }

    /// Resistor test of `a` to `b`, folded into the session.
    pub(crate) fn check_resistor(
        &mut self,
        session: &mut ClassificationSession,
        a: Probe,
        b: Probe,
    ) -> Result<(), Error<P::Error>> {
        match self.measure_resistance(a, b)? {
            Some(value) => session.offer_resistor(a, b, value, a.third(b)),
            None => session.reject_resistor(a, b),
        }

        Ok(())
    }

    fn forward_voltage(
        &mut self,
        config: ProbeConfig,
        anode: Probe,
        cathode: Probe,
        ms: u16,
    ) -> Result<u16, Error<P::Error>> {
        Ok(self.divider(config, anode, cathode, ms)?.across())
    }

    /// Diode test with `anode` pulled up and `cathode` tied low.
    pub(crate) fn check_diode(
        &mut self,
        session: &mut ClassificationSession,
        anode: Probe,
        cathode: Probe,
    ) -> Result<(), Error<P::Error>> {
        let third = anode.third(cathode);
        let low_current = ProbeConfig::NEUTRAL
            .with(anode, ProbeMode::PullUpHigh)
            .with(cathode, ProbeMode::DriveLow);
        let high_current = ProbeConfig::NEUTRAL
            .with(anode, ProbeMode::PullUpLow)
            .with(cathode, ProbeMode::DriveLow);

        // discharge, then charge, a gate that might sit on the third probe
        let mut v_low = 0;
        for gate in [ProbeMode::PullDownLow, ProbeMode::PullUpLow] {
            self.apply(
                ProbeConfig::NEUTRAL
                    .with(third, gate)
                    .with(cathode, ProbeMode::DriveLow),
            )?;
            self.wait_ms(5);
            v_low = v_low.max(self.forward_voltage(low_current, anode, cathode, 20)?);
        }

        let v_high = self.forward_voltage(high_current, anode, cathode, 10)?;
        let again = self.forward_voltage(low_current, anode, cathode, 20)?;

        if again > v_low + v_low / 4 + 20 {
            tracing::trace!(%anode, %cathode, v_low, again, "charged like a capacitor");
            return Ok(());
        }
        if !(DIODE_MIN_MV..=DIODE_MAX_MV).contains(&v_high) {
            return Ok(());
        }
        if v_high as u32 > v_low as u32 * DIODE_MAX_RATIO
            || v_low as u32 > v_high as u32 * DIODE_MAX_RATIO
        {
            tracing::trace!(%anode, %cathode, v_low, v_high, "no diode curve");
            return Ok(());
        }

        tracing::debug!(%anode, %cathode, v_high, v_low, "diode");
        session.add_diode(DiodeRecord {
            anode,
            cathode,
            v_high,
            v_low,
        });

        Ok(())
    }
}

/// Two readings of a settled node agree within 2 mV plus 2 %.
fn is_stable(first: u16, second: u16) -> bool {
    first.abs_diff(second) <= 2 + first.max(second) / 50
}
