//! Inductance from the rise time of the current through a coil.
//!
//! The coil is switched onto the supply with a shunt in series. The capture
//! timer measures how long the shunt voltage takes to reach the comparator
//! threshold; with the total series resistance known, the time constant
//! follows from the ratio of the threshold to the final shunt voltage.

use embedded_hal::blocking::delay::{DelayMs, DelayUs};
use embedded_hal::watchdog::Watchdog;

use crate::error::Error;
use crate::hal::{CaptureTimer, Comparator, ProbePort};
use crate::probe::{Probe, ProbeConfig, ProbeMode};
use crate::session::ClassificationSession;
use crate::tester::Tester;
use crate::units::Scaled;

/// Coils are only looked for behind resistances up to this (Ω).
const MAX_RESISTANCE_OHMS: u64 = 2_000;
/// Below this many ticks the high current mode is tried.
const HIGH_CURRENT_TICKS: u32 = 40;
const DEAD_TIME_US: u16 = 8;
const RISE_OVERFLOWS: u32 = 2;
const RELEASE_MS: u16 = 10;
/// Shorter rises are within the switching latency.
const MIN_RISE_TICKS: u32 = 4;
const MIN_INDUCTANCE_NH: u64 = 10_000;

/// Shunt between the coil and ground.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Shunt {
    /// Rl and the pin resistance.
    LowCurrent,
    /// The pin resistance alone.
    HighCurrent,
}

impl Shunt {
    fn mode(self) -> ProbeMode {
        match self {
            Shunt::LowCurrent => ProbeMode::PullDownLow,
            Shunt::HighCurrent => ProbeMode::DriveLow,
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
    /// Measures the inductance between `high` and `low` of a coil whose
    /// winding resistance is `resistance`, in henries.
    pub fn measure_inductance(
        &mut self,
        high: Probe,
        low: Probe,
        resistance: Scaled,
    ) -> Result<Scaled, Error<P::Error>> {
        self.neutral().inductance(high, low, resistance)
    }

    /// Looks for a coil behind the single confirmed resistor of `session`.
    pub(crate) fn check_inductor(
        &mut self,
        session: &mut ClassificationSession,
    ) -> Result<(), Error<P::Error>> {
        let (first, more) = {
            let mut confirmed = session.confirmed_resistors();
            (confirmed.next().copied(), confirmed.next().is_some())
        };
        let (Some(resistor), false) = (first, more) else {
            return Ok(());
        };

        match resistor.value.to_exponent(0) {
            Some(ohms) if ohms <= MAX_RESISTANCE_OHMS => {}
            _ => return Ok(()),
        }

        match self.inductance(resistor.a, resistor.b, resistor.value) {
            Ok(henries) => {
                tracing::debug!(a = %resistor.a, b = %resistor.b, %henries, "inductor");
                session.inductance = Some(henries);
                Ok(())
            }
            Err(Error::Hardware(err)) => Err(Error::Hardware(err)),
            Err(err) => {
                tracing::trace!(%err, "no inductance");
                Ok(())
            }
        }
    }

    fn inductance(
        &mut self,
        high: Probe,
        low: Probe,
        resistance: Scaled,
    ) -> Result<Scaled, Error<P::Error>> {
        self.discharge_probes()?;
        let ohms = resistance.to_exponent(0).ok_or(Error::TooHigh)? as u32;

        let mut shunt = Shunt::LowCurrent;
        let mut ticks = self.rise_time(high, low, shunt)?;

        let fast = ticks.map_or(true, |ticks| ticks < HIGH_CURRENT_TICKS);
        if fast && self.final_shunt_mv(Shunt::HighCurrent, ohms) > self.threshold_mv() {
            if let Some(high_current) = self.rise_time(high, low, Shunt::HighCurrent)? {
                shunt = Shunt::HighCurrent;
                ticks = Some(high_current);
            }
        }

        let ticks = ticks.ok_or(Error::TooLow)?;
        let u_max = self.final_shunt_mv(shunt, ohms);
        let threshold = self.threshold_mv();
        if threshold >= u_max {
            return Err(Error::TooLow);
        }

        let ratio = threshold * 1000 / u_max;
        let factor = self.tables.inductor.lookup(ratio).ok_or(Error::Implausible)? as u64;

        let r_total = self.total_ohms(shunt, ohms) as u64;
        let ns = ticks as u64 * 1_000_000_000 / self.config.clock_hz as u64;
        let nh = ns * r_total * factor / 1000;
        tracing::trace!(?shunt, ticks, ratio, nh, "coil");

        if nh < MIN_INDUCTANCE_NH {
            return Err(Error::TooLow);
        }

        Ok(Scaled::from_wide(nh, -9))
    }

    /// Comparator threshold (mV).
    fn threshold_mv(&self) -> u32 {
        (self.bandgap_mv() as i32 + self.calibration.comp_offset() as i32).max(0) as u32
    }

    fn total_ohms(&self, shunt: Shunt, coil_ohms: u32) -> u32 {
        self.series_ohms(ProbeMode::DriveHigh) + coil_ohms + self.series_ohms(shunt.mode())
    }

    /// Shunt voltage (mV) once the current has settled.
    fn final_shunt_mv(&self, shunt: Shunt, coil_ohms: u32) -> u32 {
        let total = self.total_ohms(shunt, coil_ohms).max(1);
        self.config.vcc_mv as u32 * self.series_ohms(shunt.mode()) / total
    }

    /// The shorter of a direct and a delayed start, in timer ticks.
    fn rise_time(
        &mut self,
        high: Probe,
        low: Probe,
        shunt: Shunt,
    ) -> Result<Option<u32>, Error<P::Error>> {
        let direct = self.rise(high, low, shunt, false)?;
        let delayed = self.rise(high, low, shunt, true)?;

        Ok(match (direct, delayed) {
            (Some(direct), Some(delayed)) => Some(direct.min(delayed)),
            (direct, delayed) => direct.or(delayed),
        })
    }

    /// One rise time measurement. The delayed start switches the coil on
    /// first and starts the timer after a dead time, which is added back.
    fn rise(
        &mut self,
        high: Probe,
        low: Probe,
        shunt: Shunt,
        delayed: bool,
    ) -> Result<Option<u32>, Error<P::Error>> {
        let idle = ProbeConfig::NEUTRAL
            .with(high, ProbeMode::DriveLow)
            .with(low, shunt.mode());
        let drive = idle.with(high, ProbeMode::DriveHigh);

        self.apply(idle)?;
        self.wait_ms(RELEASE_MS);
        self.comparator.select(low);

        let ticks = if delayed {
            self.apply(drive)?;
            self.wait_us(DEAD_TIME_US);
            self.timer.start();
            let dead_ticks = DEAD_TIME_US as u32 * (self.config.clock_hz / 1_000_000);
            self.wait_for_capture(RISE_OVERFLOWS).map(|ticks| ticks + dead_ticks)
        } else {
            self.timer.start();
            self.apply(drive)?;
            self.wait_for_capture(RISE_OVERFLOWS)
        };

        self.apply(
            ProbeConfig::NEUTRAL
                .with(high, ProbeMode::DriveLow)
                .with(low, ProbeMode::DriveLow),
        )?;
        self.comparator.disable();
        self.wait_ms(RELEASE_MS);

        match ticks {
            Ok(ticks) if ticks >= MIN_RISE_TICKS => Ok(Some(ticks)),
            Ok(_) | Err(Error::TooHigh) => Ok(None),
            Err(err) => Err(err),
        }
    }
}
