use embedded_hal::blocking::delay::{DelayMs, DelayUs};
use embedded_hal::watchdog::Watchdog;

use crate::error::Error;
use crate::hal::{CaptureTimer, Comparator, ProbePort};
use crate::probe::{Probe, ProbeConfig, ProbeMode};
use crate::tester::Tester;

/// A probe at or below this voltage (mV) counts as discharged.
const DISCHARGED_MV: u16 = 2;
/// Below this voltage (mV) a probe is pulled down directly.
const DIRECT_PULL_DOWN_MV: u16 = 800;
/// Rounds without a falling voltage before giving up.
const BASELINE_ROUNDS: u16 = 40;
/// Upper bound of rounds. With the default sampling this allows well over
/// a minute, enough for 100 µF charged to a few volts; anything larger is
/// reported as not discharged.
const MAX_ROUNDS: u16 = 10_000;

impl<P, C, T, D, W> Tester<P, C, T, D, W>
where
    P: ProbePort,
    C: Comparator,
    T: CaptureTimer,
    D: DelayMs<u16> + DelayUs<u16>,
    W: Watchdog,
{
    /// Drains any charge from the part connected to the probes.
    ///
    /// Fails with [`Error::NotDischarged`] when the voltages stop falling
    /// before every probe is discharged, which usually means a battery is
    /// connected. Every reading that is lower than the previous one of the
    /// same probe extends the timeout.
    pub fn discharge(&mut self) -> Result<(), Error<P::Error>> {
        self.neutral().discharge_probes()
    }

    pub(crate) fn discharge_probes(&mut self) -> Result<(), Error<P::Error>> {
        let mut config = ProbeConfig::all(ProbeMode::PullDownHigh);
        self.apply(config)?;

        let mut last = [u16::MAX; 3];
        let mut residual = [0; 3];
        let mut limit = BASELINE_ROUNDS;
        let mut round = 0;

        loop {
            self.feed();

            let mut discharged = 0;
            let mut switched = false;

            for probe in Probe::ALL {
                let mv = self.voltage(probe)?;
                let index = probe.index();
                residual[index] = mv;

                if mv < last[index] {
                    limit = (round + BASELINE_ROUNDS).min(MAX_ROUNDS);
                }
                last[index] = mv;

                if mv < DIRECT_PULL_DOWN_MV && config.mode(probe) == ProbeMode::PullDownHigh {
                    config.set(probe, ProbeMode::DriveLow);
                    switched = true;
                }

                if mv <= DISCHARGED_MV {
                    discharged += 1;
                }
            }

            if discharged == Probe::ALL.len() {
                tracing::trace!(round, "probes discharged");
                return Ok(());
            }

            if switched {
                self.apply(config)?;
            }

            round += 1;
            if round >= limit {
                let (probe, millivolts) = Probe::ALL
                    .iter()
                    .map(|probe| (*probe, residual[probe.index()]))
                    .max_by_key(|(_, mv)| *mv)
                    .unwrap_or((Probe::One, 0));

                tracing::warn!(%probe, millivolts, round, "probe does not discharge");
                return Err(Error::NotDischarged { probe, millivolts });
            }

            self.wait_ms(1);
        }
    }
}
