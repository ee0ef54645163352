//! Capacitance measurement.
//!
//! Large capacitors are charged through Rl in pulses of 10 ms or 1 ms until
//! they reach 300 mV. Anything that gets there within the first 1 ms pulse
//! is timed instead: the capture timer counts clock ticks while the
//! capacitor charges through Rh up to the comparator threshold.

use embedded_hal::blocking::delay::{DelayMs, DelayUs};
use embedded_hal::watchdog::Watchdog;

use crate::error::Error;
use crate::hal::{CaptureTimer, Comparator, ProbePort};
use crate::probe::{Probe, ProbeConfig, ProbeMode};
use crate::session::{CapacitorRecord, ClassificationSession};
use crate::tester::Tester;
use crate::units::{current, Scaled};

/// Voltage (mV) a large capacitor is charged to.
const LARGE_CAP_TARGET_MV: u16 = 300;
const MAX_PULSES: u32 = 500;
/// Largest voltage loss (mV) during the self-discharge check.
const MAX_SELF_DISCHARGE_MV: u16 = 100;

/// Timer overflows before giving up on a small capacitor.
const SMALL_CAP_OVERFLOWS: u32 = 1_000;
/// Results at or above this are reported in nF.
const SMALL_CAP_NF_PF: u64 = 100_000;
const MIN_CAPACITANCE_PF: u64 = 5;

/// Capacitors in this range (pF) refine the calibration offsets.
const CALIBRATION_RANGE_PF: core::ops::RangeInclusive<u64> = 100_000..=20_000_000;

const LEAKAGE_STEP_MS: u16 = 10;
const LEAKAGE_STEPS: u32 = 100;
/// Below this (mV) the leakage current is sensed through Rh instead.
const LEAKAGE_RH_MV: u16 = 10;

const BLEED_STEP_MS: u16 = 10;
const BLEED_STEPS: u32 = 1_000;
const BLEED_DONE_MV: u16 = 50;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Pulse {
    Long,
    Short,
}

impl Pulse {
    fn ms(self) -> u16 {
        match self {
            Pulse::Long => 10,
            Pulse::Short => 1,
        }
    }
}

impl<P, C, T, D, W> Tester<P, C, T, D, W>
where
    P: ProbePort,
    C: Comparator,
    T: CaptureTimer,
    D: DelayMs<u16> + DelayUs<u16>,
    W: Watchdog,
{
    /// Measures the capacitor between `pull_down` and `pull_up`.
    ///
    /// Returns [`Error::TooLow`] for less than a few pF, [`Error::TooHigh`]
    /// when the capacitor does not charge in time and
    /// [`Error::Implausible`] when it loses its charge on its own.
    pub fn measure_capacitance(
        &mut self,
        pull_down: Probe,
        pull_up: Probe,
    ) -> Result<CapacitorRecord, Error<P::Error>> {
        self.neutral().capacitor(pull_down, pull_up)
    }

    /// Looks for a capacitor and records it in `session`.
    pub(crate) fn check_capacitor(
        &mut self,
        session: &mut ClassificationSession,
        pull_down: Probe,
        pull_up: Probe,
    ) -> Result<(), Error<P::Error>> {
        match self.capacitor(pull_down, pull_up) {
            Ok(record) => {
                tracing::debug!(%pull_down, %pull_up, value = %record.value, "capacitor");
                if session.capacitors.push(record).is_err() {
                    tracing::debug!("capacitor list full");
                }
                Ok(())
            }
            Err(Error::Hardware(err)) => Err(Error::Hardware(err)),
            Err(err) => {
                tracing::trace!(%pull_down, %pull_up, %err, "no capacitor");
                Ok(())
            }
        }
    }

    fn capacitor(
        &mut self,
        pull_down: Probe,
        pull_up: Probe,
    ) -> Result<CapacitorRecord, Error<P::Error>> {
        let (raw, value) = match self.large_capacitance(pull_down, pull_up) {
            Ok(nf) => (nf, nf),
            Err(Error::TooLow) => self.small_capacitance(pull_down, pull_up)?,
            Err(err) => {
                self.bleed(pull_down, pull_up)?;
                return Err(err);
            }
        };

        let leakage = self.capacitor_leakage(pull_down, pull_up)?;
        self.bleed(pull_down, pull_up)?;

        Ok(CapacitorRecord {
            pull_down,
            pull_up,
            raw,
            value,
            leakage,
        })
    }

    /// Charges in pulses through Rl and returns the capacitance in farads.
    fn large_capacitance(
        &mut self,
        pull_down: Probe,
        pull_up: Probe,
    ) -> Result<Scaled, Error<P::Error>> {
        let charge = ProbeConfig::NEUTRAL
            .with(pull_down, ProbeMode::DriveLow)
            .with(pull_up, ProbeMode::PullUpLow);
        let hold = ProbeConfig::NEUTRAL.with(pull_down, ProbeMode::DriveLow);

        let mut pulse = Pulse::Long;
        let (pulses, mut mv) = loop {
            self.discharge_probes()?;

            let mut pulses = 0;
            let mut mv = 0;
            while pulses < MAX_PULSES && mv < LARGE_CAP_TARGET_MV {
                self.feed();
                self.apply(charge)?;
                self.wait_ms(pulse.ms());
                self.apply(hold)?;
                pulses += 1;
                mv = self.voltage(pull_up)?;
            }

            if mv < LARGE_CAP_TARGET_MV {
                tracing::debug!(pulses, mv, "capacitor does not charge");
                return Err(Error::TooHigh);
            }

            match (pulses, pulse) {
                (1, Pulse::Long) => {
                    self.bleed(pull_down, pull_up)?;
                    pulse = Pulse::Short;
                }
                (1, Pulse::Short) => {
                    self.bleed(pull_down, pull_up)?;
                    return Err(Error::TooLow);
                }
                _ => break (pulses, mv),
            }
        };

        // a real capacitor holds its charge for as long as it took to charge
        let idle_ms = pulses * pulse.ms() as u32;
        self.wait_long(idle_ms);
        let held = self.voltage(pull_up)?;
        let loss = mv.saturating_sub(held);
        if loss > MAX_SELF_DISCHARGE_MV {
            tracing::debug!(mv, held, "capacitor discharges itself");
            return Err(Error::Implausible);
        }
        mv += loss;

        let factor = self
            .tables
            .large_cap
            .lookup(mv as u32)
            .ok_or(Error::Implausible)? as u64;

        let correction = match pulse {
            Pulse::Long => self.config.large_cap_correction.pulse_10ms,
            Pulse::Short => self.config.large_cap_correction.pulse_1ms,
        } as u64;

        let nf = idle_ms as u64 * factor;
        let nf = nf * (1000 + correction) / 1000;
        tracing::trace!(pulses, ms = pulse.ms(), mv, nf, "large capacitor");

        Ok(Scaled::from_wide(nf, -9))
    }

    /// Times the charge through Rh up to the comparator threshold. Returns
    /// the raw and the zero-corrected capacitance in farads.
    fn small_capacitance(
        &mut self,
        pull_down: Probe,
        pull_up: Probe,
    ) -> Result<(Scaled, Scaled), Error<P::Error>> {
        self.discharge_probes()?;
        self.apply(ProbeConfig::NEUTRAL.with(pull_down, ProbeMode::DriveLow))?;

        self.comparator.select(pull_up);
        self.timer.start();
        self.apply(
            ProbeConfig::NEUTRAL
                .with(pull_down, ProbeMode::DriveLow)
                .with(pull_up, ProbeMode::PullUpHigh),
        )?;
        let ticks = self.wait_for_capture(SMALL_CAP_OVERFLOWS);
        self.apply(ProbeConfig::NEUTRAL.with(pull_down, ProbeMode::DriveLow))?;
        self.comparator.disable();
        let ticks = ticks?;

        let threshold = self.bandgap_mv() as i32 + self.calibration.comp_offset() as i32;
        let factor = self
            .tables
            .small_cap
            .lookup(threshold.max(0) as u32)
            .ok_or(Error::Implausible)? as u64;

        let pf = ticks as u64 * factor / 1000;
        tracing::trace!(ticks, threshold, pf, "small capacitor");

        if CALIBRATION_RANGE_PF.contains(&pf) {
            self.calibrate_offsets(pull_up)?;
        }

        if pf >= SMALL_CAP_NF_PF {
            let nf = Scaled::from_wide(pf / 1000, -9);
            return Ok((nf, nf));
        }

        let value = pf.saturating_sub(self.calibration.cap_zero as u64);
        if value < MIN_CAPACITANCE_PF {
            return Err(Error::TooLow);
        }

        Ok((Scaled::from_wide(pf, -12), Scaled::from_wide(value, -12)))
    }

    /// Charges the capacitor from the supply through Rl and measures the
    /// remaining current in amperes once it stops falling.
    fn capacitor_leakage(
        &mut self,
        pull_down: Probe,
        pull_up: Probe,
    ) -> Result<Option<Scaled>, Error<P::Error>> {
        let sense = ProbeConfig::NEUTRAL
            .with(pull_up, ProbeMode::DriveHigh)
            .with(pull_down, ProbeMode::PullDownLow);
        self.apply(sense)?;

        let mut last = self.voltage(pull_down)?;
        let mut settled = false;
        for _ in 0..LEAKAGE_STEPS {
            self.feed();
            self.wait_ms(LEAKAGE_STEP_MS);
            let mv = self.voltage(pull_down)?;
            let falling = last.saturating_sub(mv);
            last = mv;
            if falling < 2 {
                settled = true;
                break;
            }
        }

        if !settled {
            return Ok(None);
        }

        let (mv, ohms) = if last < LEAKAGE_RH_MV {
            self.apply(sense.with(pull_down, ProbeMode::PullDownHigh))?;
            self.wait_ms(20);
            (self.voltage(pull_down)?, self.series_ohms(ProbeMode::PullDownHigh))
        } else {
            (last, self.series_ohms(ProbeMode::PullDownLow))
        };

        Ok(current(mv, ohms))
    }

    /// Drains the capacitor through Rl before the regular discharge.
    fn bleed(&mut self, pull_down: Probe, pull_up: Probe) -> Result<(), Error<P::Error>> {
        self.apply(
            ProbeConfig::NEUTRAL
                .with(pull_down, ProbeMode::DriveLow)
                .with(pull_up, ProbeMode::PullDownLow),
        )?;

        for _ in 0..BLEED_STEPS {
            self.feed();
            if self.voltage(pull_up)? < BLEED_DONE_MV {
                break;
            }
            self.wait_ms(BLEED_STEP_MS);
        }

        self.discharge_probes()
    }

    fn wait_long(&mut self, ms: u32) {
        let mut left = ms;
        while left > 0 {
            let step = left.min(100);
            self.feed();
            self.wait_ms(step as u16);
            left -= step;
        }
    }
}
