//! Identification and measurement core of a three-probe component tester.
//!
//! A [`Tester`] owns the probe port, the analog comparator, the capture timer,
//! a delay and the watchdog of the instrument. [`Tester::identify`] drives
//! the three probes through every assignment of roles, decides what kind of
//! part is connected (resistor, capacitor, inductor, diode, bipolar
//! transistor, FET, IGBT, thyristor or triac) and measures its values.
//!
//! Each probe is a pin that can be driven directly or through one of two
//! series resistors, Rl (680 Ω by default) and Rh (470 kΩ), towards either
//! rail; see [`ProbeMode`]. Voltages are read with the ADC against the supply
//! or the internal bandgap.
//!
//! The offsets learned by self-calibration are part of [`Calibration`]; read
//! them back with [`Tester::calibration`] to persist them between runs.

#![cfg_attr(not(test), no_std)]

mod calibrate;
mod capacitor;
mod capture;
mod config;
mod discharge;
mod error;
mod hal;
mod identify;
mod inductor;
mod interpolate;
mod passive;
mod probe;
mod semi;
mod session;
mod table;
mod tester;
mod units;

#[cfg(test)]
mod bench;

pub use capture::reconcile;
pub use config::{Calibration, CalibrationError, Config, LargeCapCorrection};
pub use error::Error;
pub use hal::{CaptureTimer, Comparator, OverflowCounter, ProbePort, Reference};
pub use probe::{PortRegisters, Probe, ProbeAssignment, ProbeConfig, ProbeMode, ProbePins};
pub use session::{
    CapacitorRecord, Channel, ClassificationResult, DiodeRecord, FetMode, FetTechnology, Found,
    Polarity, ResistorRecord, TransistorKind, TransistorRecord,
};
pub use table::{FactorTable, Tables};
pub use tester::{Neutral, Tester};
pub use units::Scaled;
