use embedded_hal::blocking::delay::{DelayMs, DelayUs};
use embedded_hal::watchdog::Watchdog;

use crate::error::Error;
use crate::hal::{CaptureTimer, Comparator, ProbePort, Reference};
use crate::probe::Probe;
use crate::tester::Tester;

/// Conversions per reference while comparing the two references.
const CALIBRATION_SAMPLES: u32 = 100;

impl<P, C, T, D, W> Tester<P, C, T, D, W>
where
    P: ProbePort,
    C: Comparator,
    T: CaptureTimer,
    D: DelayMs<u16> + DelayUs<u16>,
    W: Watchdog,
{
    /// Refines the reference and comparator offsets from a capacitor on
    /// `probe` that was just charged to the comparator's switching point and
    /// is left floating.
    ///
    /// Offsets outside ±[`Calibration::OFFSET_LIMIT_MV`] are discarded and
    /// the stored values stay in effect.
    ///
    /// [`Calibration::OFFSET_LIMIT_MV`]: crate::Calibration::OFFSET_LIMIT_MV
    pub(crate) fn calibrate_offsets(&mut self, probe: Probe) -> Result<(), Error<P::Error>> {
        let nominal = self.config.bandgap_mv as i32;

        let supply = self.average(probe, Reference::Supply, self.config.vcc_mv as u32)? as i32;
        let bandgap = self.average(probe, Reference::Bandgap, nominal as u32)? as i32;

        if bandgap == 0 {
            return Ok(());
        }

        // The same voltage reads higher against a bandgap that is lower than
        // its nominal value.
        let ref_offset = (nominal * (supply - bandgap)) / bandgap;
        match self.calibration.set_ref_offset(ref_offset as i16) {
            Ok(()) => tracing::debug!(ref_offset, "reference offset updated"),
            Err(err) => tracing::debug!(%err, "reference offset discarded"),
        }

        let settled = self.voltage(probe)? as i32;
        let comp_offset = settled - self.bandgap_mv() as i32;
        match self.calibration.set_comp_offset(comp_offset as i16) {
            Ok(()) => tracing::debug!(comp_offset, "comparator offset updated"),
            Err(err) => tracing::debug!(%err, "comparator offset discarded"),
        }

        Ok(())
    }

    /// Averages raw conversions against `reference`, scaled to `full_scale`.
    fn average(
        &mut self,
        probe: Probe,
        reference: Reference,
        full_scale: u32,
    ) -> Result<u32, Error<P::Error>> {
        let mut sum = 0;
        for _ in 0..CALIBRATION_SAMPLES {
            sum += nb::block!(self.probes.convert(probe, reference))? as u32;
        }

        let divisor = self.config.adc_range as u32 * CALIBRATION_SAMPLES;
        Ok((sum * full_scale + divisor / 2) / divisor)
    }
}
