use core::ops::{Deref, DerefMut};

use embedded_hal::blocking::delay::{DelayMs, DelayUs};
use embedded_hal::watchdog::Watchdog;

use crate::config::{Calibration, Config};
use crate::error::Error;
use crate::hal::{CaptureTimer, Comparator, ProbePort, Reference};
use crate::probe::{Probe, ProbeConfig, ProbeMode};
use crate::table::Tables;

/// A component tester: the probe port, comparator and capture timer with
/// the configuration and calibration of one instrument.
///
/// The tester exclusively owns its hardware. Every public measurement leaves
/// the probes floating, the timer stopped and the comparator disabled, also
/// when it fails.
pub struct Tester<P, C, T, D, W> {
    pub(crate) probes: P,
    pub(crate) comparator: C,
    pub(crate) timer: T,
    pub(crate) delay: D,
    pub(crate) watchdog: W,
    pub(crate) config: Config,
    pub(crate) calibration: Calibration,
    pub(crate) tables: Tables,
}

impl<P, C, T, D, W> Tester<P, C, T, D, W>
where
    P: ProbePort,
    C: Comparator,
    T: CaptureTimer,
    D: DelayMs<u16> + DelayUs<u16>,
    W: Watchdog,
{
    pub fn new(
        probes: P,
        comparator: C,
        timer: T,
        delay: D,
        watchdog: W,
        config: Config,
        calibration: Calibration,
    ) -> Self {
        let tables = Tables::new(&config, &calibration);

        Self {
            probes,
            comparator,
            timer,
            delay,
            watchdog,
            config,
            calibration,
            tables,
        }
    }

    /// Destroys the tester and returns the hardware.
    pub fn free(self) -> (P, C, T, D, W) {
        (
            self.probes,
            self.comparator,
            self.timer,
            self.delay,
            self.watchdog,
        )
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The calibration, including offsets refined during measurements, for
    /// the caller to persist.
    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    /// Applies `config` to all three probes at once.
    pub fn apply(&mut self, config: ProbeConfig) -> Result<(), Error<P::Error>> {
        self.probes.configure(&config)?;
        Ok(())
    }

    /// Reads the voltage of `probe` in mV, averaging `samples` conversions.
    ///
    /// The first conversion uses the supply reference. Below the bandgap
    /// voltage the reading switches to the bandgap reference for a finer
    /// resolution.
    pub fn read_voltage(&mut self, probe: Probe, samples: u8) -> Result<u16, Error<P::Error>> {
        let range = self.config.adc_range as u32;
        let samples = samples.max(1) as u32;
        let bandgap = self.bandgap_mv();

        let first = nb::block!(self.probes.convert(probe, Reference::Supply))? as u32;
        let supply_mv = first * self.config.vcc_mv as u32 / range;

        let (reference, full_scale) = if supply_mv < bandgap {
            (Reference::Bandgap, bandgap)
        } else {
            (Reference::Supply, self.config.vcc_mv as u32)
        };

        let mut sum = 0;
        for _ in 0..samples {
            sum += nb::block!(self.probes.convert(probe, reference))? as u32;
        }

        let divisor = range * samples;
        Ok(((sum * full_scale + divisor / 2) / divisor) as u16)
    }

    /// Returns a guard that restores the hardware to neutral when dropped.
    pub fn neutral(&mut self) -> Neutral<'_, P, C, T, D, W> {
        Neutral { tester: self }
    }

    /// Actual bandgap voltage in mV.
    pub(crate) fn bandgap_mv(&self) -> u32 {
        (self.config.bandgap_mv as i32 + self.calibration.ref_offset() as i32) as u32
    }

    /// Resistance (Ω) between a probe in `mode` and the rail it is tied to.
    pub(crate) fn series_ohms(&self, mode: ProbeMode) -> u32 {
        let ri_low = self.calibration.ri_low as u32 / 10;
        let ri_high = self.calibration.ri_high as u32 / 10;

        match mode {
            ProbeMode::Float => 0,
            ProbeMode::DriveLow => ri_low,
            ProbeMode::DriveHigh => ri_high,
            ProbeMode::PullUpLow => self.config.r_low + ri_high,
            ProbeMode::PullDownLow => self.config.r_low + ri_low,
            ProbeMode::PullUpHigh => self.config.r_high + ri_high,
            ProbeMode::PullDownHigh => self.config.r_high + ri_low,
        }
    }

    /// Regular voltage reading with the configured number of samples.
    pub(crate) fn voltage(&mut self, probe: Probe) -> Result<u16, Error<P::Error>> {
        self.read_voltage(probe, self.config.samples)
    }

    pub(crate) fn wait_ms(&mut self, ms: u16) {
        self.delay.delay_ms(ms);
    }

    pub(crate) fn wait_us(&mut self, us: u16) {
        self.delay.delay_us(us);
    }

    pub(crate) fn feed(&mut self) {
        self.watchdog.feed();
    }

    fn reset(&mut self) -> Result<(), P::Error> {
        self.timer.stop();
        self.comparator.disable();
        self.probes.configure(&ProbeConfig::NEUTRAL)
    }
}

/// Scoped access to a [`Tester`] that floats all probes, stops the capture
/// timer and disables the comparator when dropped.
pub struct Neutral<'a, P, C, T, D, W>
where
    P: ProbePort,
    C: Comparator,
    T: CaptureTimer,
    D: DelayMs<u16> + DelayUs<u16>,
    W: Watchdog,
{
    tester: &'a mut Tester<P, C, T, D, W>,
}

impl<P, C, T, D, W> Deref for Neutral<'_, P, C, T, D, W>
where
    P: ProbePort,
    C: Comparator,
    T: CaptureTimer,
    D: DelayMs<u16> + DelayUs<u16>,
    W: Watchdog,
{
    type Target = Tester<P, C, T, D, W>;

    fn deref(&self) -> &Self::Target {
        self.tester
    }
}

impl<P, C, T, D, W> DerefMut for Neutral<'_, P, C, T, D, W>
where
    P: ProbePort,
    C: Comparator,
    T: CaptureTimer,
    D: DelayMs<u16> + DelayUs<u16>,
    W: Watchdog,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.tester
    }
}

impl<P, C, T, D, W> Drop for Neutral<'_, P, C, T, D, W>
where
    P: ProbePort,
    C: Comparator,
    T: CaptureTimer,
    D: DelayMs<u16> + DelayUs<u16>,
    W: Watchdog,
{
    fn drop(&mut self) {
        if self.tester.reset().is_err() {
            tracing::warn!("failed to float the probes");
        }
    }
}
