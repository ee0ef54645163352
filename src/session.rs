use heapless::Vec;

use crate::probe::Probe;
use crate::units::Scaled;

pub const MAX_RESISTORS: usize = 3;
pub const MAX_DIODES: usize = 6;
pub const MAX_CAPACITORS: usize = 3;

/// Values below this (0.01 Ω) get the wide agreement window.
const LOW_RESISTANCE: u64 = 10_00;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Polarity {
    Npn,
    Pnp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Channel {
    N,
    P,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetMode {
    Enhancement,
    Depletion,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetTechnology {
    Mosfet,
    Jfet,
}

/// Kind of a three-terminal part, with the details that refine it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransistorKind {
    Bjt {
        polarity: Polarity,
        /// A second junction structure was found with the same base.
        parasitic: bool,
    },
    Fet {
        channel: Channel,
        mode: FetMode,
        technology: FetTechnology,
        /// Drain and source are interchangeable.
        symmetric: bool,
    },
    Igbt {
        channel: Channel,
    },
    Thyristor,
    Triac,
}

impl TransistorKind {
    pub fn found(&self) -> Found {
        match self {
            TransistorKind::Bjt { .. } => Found::Bjt,
            TransistorKind::Fet { .. } => Found::Fet,
            TransistorKind::Igbt { .. } => Found::Igbt,
            TransistorKind::Thyristor => Found::Thyristor,
            TransistorKind::Triac => Found::Triac,
        }
    }

    /// Kinds that are unambiguous once they are found.
    fn is_conclusive(&self) -> bool {
        matches!(
            self,
            TransistorKind::Fet { .. } | TransistorKind::Igbt { .. } | TransistorKind::Thyristor
        )
    }
}

/// The outcome of an identification run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Found {
    #[default]
    None,
    /// A probe holds a voltage that does not drain away.
    Battery {
        probe: Probe,
        millivolts: u16,
    },
    Resistor,
    Capacitor,
    Inductor,
    Diode,
    Bjt,
    Thyristor,
    Triac,
    Igbt,
    Fet,
}

impl Found {
    pub fn rank(&self) -> u8 {
        match self {
            Found::None | Found::Battery { .. } => 0,
            Found::Resistor => 1,
            Found::Capacitor => 2,
            Found::Inductor => 3,
            Found::Diode => 4,
            Found::Bjt => 5,
            Found::Thyristor => 6,
            Found::Triac => 7,
            Found::Igbt => 8,
            Found::Fet => 9,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResistorRecord {
    pub a: Probe,
    pub b: Probe,
    /// Resistance in ohms.
    pub value: Scaled,
    /// The probe left floating while measuring.
    pub witness: Probe,
    /// Both orientations agreed.
    pub confirmed: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CapacitorRecord {
    pub pull_down: Probe,
    pub pull_up: Probe,
    /// Capacitance in farads before the zero offset is subtracted.
    pub raw: Scaled,
    pub value: Scaled,
    /// Leakage current in amperes.
    pub leakage: Option<Scaled>,
}

/// Forward voltages in mV at about 7 mA and 10 µA.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiodeRecord {
    pub anode: Probe,
    pub cathode: Probe,
    pub v_high: u16,
    pub v_low: u16,
}

/// A three-terminal part.
///
/// The terminals are, by kind:
///
/// | kind      | `a`       | `b`  | `c`     |
/// |-----------|-----------|------|---------|
/// | BJT       | collector | base | emitter |
/// | FET       | drain     | gate | source  |
/// | IGBT      | collector | gate | emitter |
/// | thyristor | anode     | gate | cathode |
/// | triac     | MT2       | gate | MT1     |
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransistorRecord {
    pub kind: TransistorKind,
    pub a: Probe,
    pub b: Probe,
    pub c: Probe,
    pub hfe: Option<u32>,
    /// Gate threshold voltage (mV), negative for p-channel parts.
    pub threshold_mv: Option<i16>,
    /// Gate cut-off voltage of a depletion FET (mV).
    pub cutoff_mv: Option<i16>,
    /// On resistance in ohms.
    pub r_ds_on: Option<Scaled>,
    /// Voltage across the main terminals while conducting (mV).
    pub v_on: Option<u16>,
    pub gate_trigger_mv: Option<u16>,
    /// Leakage current in amperes.
    pub leakage: Option<Scaled>,
    pub v_be: Option<u16>,
    pub score: u32,
}

impl TransistorRecord {
    pub fn new(kind: TransistorKind, a: Probe, b: Probe, c: Probe) -> Self {
        Self {
            kind,
            a,
            b,
            c,
            hfe: None,
            threshold_mv: None,
            cutoff_mv: None,
            r_ds_on: None,
            v_on: None,
            gate_trigger_mv: None,
            leakage: None,
            v_be: None,
            score: 0,
        }
    }
}

/// Everything learned during one identification run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassificationResult {
    pub found: Found,
    /// Confirmed resistors.
    pub resistors: Vec<ResistorRecord, MAX_RESISTORS>,
    pub diodes: Vec<DiodeRecord, MAX_DIODES>,
    pub capacitors: Vec<CapacitorRecord, MAX_CAPACITORS>,
    pub transistor: Option<TransistorRecord>,
    /// Inductance in henries.
    pub inductance: Option<Scaled>,
}

/// State of one identification run, threaded through the tests.
#[derive(Clone, Debug, Default)]
pub struct ClassificationSession {
    pub found: Found,
    /// A conclusive hypothesis was confirmed; no further assignments are tried.
    pub done: bool,
    pub resistors: Vec<ResistorRecord, MAX_RESISTORS>,
    pub diodes: Vec<DiodeRecord, MAX_DIODES>,
    pub capacitors: Vec<CapacitorRecord, MAX_CAPACITORS>,
    pub transistor: Option<TransistorRecord>,
    pub inductance: Option<Scaled>,
}

impl ClassificationSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds a transistor hypothesis into the session.
    pub fn consider(&mut self, candidate: TransistorRecord) {
        let Some(best) = self.transistor.as_mut() else {
            self.done = candidate.kind.is_conclusive();
            self.transistor = Some(candidate);
            return;
        };

        match (best.kind, candidate.kind) {
            (
                TransistorKind::Bjt { polarity, .. },
                TransistorKind::Bjt {
                    polarity: other, ..
                },
            ) if best.b == candidate.b => {
                let parasitic = polarity != other;
                if candidate.hfe > best.hfe {
                    *best = candidate;
                }
                if let TransistorKind::Bjt {
                    parasitic: flag, ..
                } = &mut best.kind
                {
                    *flag |= parasitic;
                }
                self.done = true;
            }
            (TransistorKind::Bjt { .. }, TransistorKind::Bjt { .. }) => {
                if candidate.hfe > best.hfe {
                    *best = candidate;
                }
            }
            (TransistorKind::Triac, TransistorKind::Triac) => {
                // gate and MT1 swapped adds the gate junction to the drop
                let lower = candidate
                    .v_on
                    .zip(best.v_on)
                    .is_some_and(|(new, old)| new < old);
                if lower {
                    *best = candidate;
                }
                self.done = true;
            }
            _ if candidate.kind.is_conclusive() => {
                *best = candidate;
                self.done = true;
            }
            (current, new) if new.found().rank() > current.found().rank() => {
                *best = candidate;
            }
            _ => {}
        }
    }

    /// Records a diode unless the same orientation is already known.
    pub fn add_diode(&mut self, diode: DiodeRecord) {
        let known = self
            .diodes
            .iter()
            .any(|d| d.anode == diode.anode && d.cathode == diode.cathode);

        if !known && self.diodes.push(diode).is_err() {
            tracing::debug!("diode list full");
        }
    }

    /// Records the resistance measured from `a` to `b`. The first orientation
    /// of a pair is kept as a candidate which the reverse orientation
    /// confirms or discards.
    pub fn offer_resistor(&mut self, a: Probe, b: Probe, value: Scaled, witness: Probe) {
        let pending = self
            .resistors
            .iter()
            .position(|r| r.a == b && r.b == a && !r.confirmed);

        match pending {
            Some(index) => {
                if resistances_agree(self.resistors[index].value, value) {
                    self.resistors[index].confirmed = true;
                    tracing::debug!(%a, %b, %value, "resistor confirmed");
                } else {
                    tracing::debug!(%a, %b, "resistor orientations disagree");
                    self.resistors.swap_remove(index);
                }
            }
            None => {
                if self.resistor(a, b).is_some() {
                    return;
                }
                let record = ResistorRecord {
                    a,
                    b,
                    value,
                    witness,
                    confirmed: false,
                };
                if self.resistors.push(record).is_err() {
                    tracing::debug!("resistor list full");
                }
            }
        }
    }

    /// Drops an unconfirmed candidate whose reverse orientation failed.
    pub fn reject_resistor(&mut self, a: Probe, b: Probe) {
        if let Some(index) = self
            .resistors
            .iter()
            .position(|r| r.a == b && r.b == a && !r.confirmed)
        {
            self.resistors.swap_remove(index);
        }
    }

    /// The resistor between `a` and `b` in either orientation.
    pub fn resistor(&self, a: Probe, b: Probe) -> Option<&ResistorRecord> {
        self.resistors
            .iter()
            .find(|r| (r.a == a && r.b == b) || (r.a == b && r.b == a))
    }

    pub fn confirmed_resistors(&self) -> impl Iterator<Item = &ResistorRecord> {
        self.resistors.iter().filter(|r| r.confirmed)
    }

    /// Derives `found` from the collected records.
    pub fn settle(&mut self) {
        if let Found::Battery { .. } = self.found {
            return;
        }

        self.found = if let Some(transistor) = &self.transistor {
            transistor.kind.found()
        } else if self.inductance.is_some() {
            Found::Inductor
        } else if !self.diodes.is_empty() {
            Found::Diode
        } else if !self.capacitors.is_empty() {
            Found::Capacitor
        } else if self.confirmed_resistors().next().is_some() {
            Found::Resistor
        } else {
            Found::None
        };
    }

    pub fn finish(mut self) -> ClassificationResult {
        self.settle();

        if let Some(transistor) = self.transistor.as_mut() {
            if let TransistorKind::Bjt { polarity, .. } = transistor.kind {
                let (anode, cathode) = match polarity {
                    Polarity::Npn => (transistor.b, transistor.c),
                    Polarity::Pnp => (transistor.c, transistor.b),
                };
                transistor.v_be = self
                    .diodes
                    .iter()
                    .find(|d| d.anode == anode && d.cathode == cathode)
                    .map(|d| d.v_high);
            }
        }

        let resistors = self
            .resistors
            .iter()
            .filter(|r| r.confirmed)
            .copied()
            .collect();

        ClassificationResult {
            found: self.found,
            resistors,
            diodes: self.diodes,
            capacitors: self.capacitors,
            transistor: self.transistor,
            inductance: self.inductance,
        }
    }
}

/// Returns `true` if both readings are within 5 %, or within 50 % below
/// 10 Ω.
pub fn resistances_agree(first: Scaled, second: Scaled) -> bool {
    let (Some(first), Some(second)) = (first.to_exponent(-2), second.to_exponent(-2)) else {
        return false;
    };

    let larger = first.max(second);
    let difference = first.abs_diff(second);

    if larger < LOW_RESISTANCE {
        difference * 2 <= larger
    } else {
        difference * 20 <= larger
    }
}
