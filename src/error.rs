use thiserror::Error;

use crate::probe::Probe;

/// Failure of a measurement routine.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum Error<E> {
    #[error("probe port error")]
    Hardware(E),
    /// The quantity is below the range of this method.
    #[error("value too low")]
    TooLow,
    /// The quantity is above the range of this method, or a bounded loop ran
    /// out of iterations.
    #[error("value too high")]
    TooHigh,
    /// The readings contradict each other.
    #[error("implausible reading")]
    Implausible,
    /// A probe did not discharge, usually because of a battery or a large
    /// charged capacitor.
    #[error("probe {probe} does not discharge, {millivolts} mV left")]
    NotDischarged { probe: Probe, millivolts: u16 },
}

impl<E> From<E> for Error<E> {
    fn from(error: E) -> Self {
        Error::Hardware(error)
    }
}
