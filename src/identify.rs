//! One identification run over all probe assignments.

use embedded_hal::blocking::delay::{DelayMs, DelayUs};
use embedded_hal::watchdog::Watchdog;

use crate::error::Error;
use crate::hal::{CaptureTimer, Comparator, ProbePort};
use crate::probe::{Probe, ProbeAssignment};
use crate::session::{ClassificationResult, ClassificationSession, Found};
use crate::tester::Tester;

/// Probe pairs searched for a capacitor, pull-down probe first.
const CAPACITOR_PAIRS: [(Probe, Probe); 3] = [
    (Probe::One, Probe::Three),
    (Probe::Two, Probe::Three),
    (Probe::One, Probe::Two),
];

impl<P, C, T, D, W> Tester<P, C, T, D, W>
where
    P: ProbePort,
    C: Comparator,
    T: CaptureTimer,
    D: DelayMs<u16> + DelayUs<u16>,
    W: Watchdog,
{
    /// Identifies the part connected to the probes and measures its values.
    ///
    /// A voltage that does not discharge ends the run early with
    /// [`Found::Battery`]. Only a fault of the probe port is returned as an
    /// error; the probes are left floating either way.
    pub fn identify(&mut self) -> Result<ClassificationResult, P::Error> {
        let mut tester = self.neutral();
        let mut session = ClassificationSession::new();

        match tester.classify(&mut session) {
            Ok(()) => {}
            Err(Error::Hardware(err)) => return Err(err),
            Err(Error::NotDischarged { probe, millivolts }) => {
                session = ClassificationSession {
                    found: Found::Battery { probe, millivolts },
                    ..ClassificationSession::default()
                };
            }
            Err(err) => tracing::debug!(%err, "identification cut short"),
        }

        let result = session.finish();
        tracing::debug!(found = ?result.found, "identified");
        Ok(result)
    }

    fn classify(&mut self, session: &mut ClassificationSession) -> Result<(), Error<P::Error>> {
        for assignment in ProbeAssignment::ALL {
            match self.check_assignment(session, assignment) {
                Ok(()) => {}
                Err(err @ (Error::Hardware(_) | Error::NotDischarged { .. })) => return Err(err),
                Err(err) => tracing::debug!(%assignment, %err, "assignment skipped"),
            }
        }

        session.settle();
        if session.found.rank() > Found::Resistor.rank() {
            return Ok(());
        }

        for (pull_down, pull_up) in CAPACITOR_PAIRS {
            let resistor = session
                .resistor(pull_down, pull_up)
                .is_some_and(|r| r.confirmed);
            let diode = session
                .diodes
                .iter()
                .any(|d| d.anode == pull_up && d.cathode == pull_down);

            if !resistor && !diode {
                self.check_capacitor(session, pull_down, pull_up)?;
            }
        }

        session.settle();
        if session.found == Found::Resistor {
            self.check_inductor(session)?;
        }

        Ok(())
    }
}
