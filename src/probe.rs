use core::fmt;

/// One of the three test terminals.
///
/// Probes are indexed 0–2 and displayed as 1–3.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Probe {
    One,
    Two,
    Three,
}

impl Probe {
    pub const ALL: [Probe; 3] = [Probe::One, Probe::Two, Probe::Three];

    pub const fn index(self) -> usize {
        match self {
            Probe::One => 0,
            Probe::Two => 1,
            Probe::Three => 2,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Static wiring of this probe.
    pub const fn pins(self) -> &'static ProbePins {
        &PROBE_PINS[self.index()]
    }

    /// The probe that is neither `self` nor `other`.
    pub fn third(self, other: Probe) -> Probe {
        match 3 - self.index() - other.index() {
            0 => Probe::One,
            1 => Probe::Two,
            _ => Probe::Three,
        }
    }
}

impl fmt::Display for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.index() + 1)
    }
}

/// Resistor port masks and ADC channel of a probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProbePins {
    pub rl_mask: u8,
    pub rh_mask: u8,
    pub adc_channel: u8,
}

static PROBE_PINS: [ProbePins; 3] = [
    ProbePins {
        rl_mask: 1 << 0,
        rh_mask: 1 << 1,
        adc_channel: 0,
    },
    ProbePins {
        rl_mask: 1 << 2,
        rh_mask: 1 << 3,
        adc_channel: 1,
    },
    ProbePins {
        rl_mask: 1 << 4,
        rh_mask: 1 << 5,
        adc_channel: 2,
    },
];

/// How a probe is connected.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProbeMode {
    /// High impedance, for sensing.
    #[default]
    Float,
    DriveLow,
    DriveHigh,
    /// Pulled up through Rl.
    PullUpLow,
    /// Pulled down through Rl.
    PullDownLow,
    /// Pulled up through Rh.
    PullUpHigh,
    /// Pulled down through Rh.
    PullDownHigh,
}

/// Port register contents for one probe configuration.
///
/// The probe pins sit on the ADC port at their channel bit; the resistor
/// pins share a second port.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PortRegisters {
    pub r_ddr: u8,
    pub r_port: u8,
    pub adc_ddr: u8,
    pub adc_port: u8,
}

/// The modes of all three probes, applied together.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProbeConfig {
    modes: [ProbeMode; 3],
}

impl ProbeConfig {
    /// Every probe floating.
    pub const NEUTRAL: ProbeConfig = ProbeConfig {
        modes: [ProbeMode::Float; 3],
    };

    pub const fn all(mode: ProbeMode) -> Self {
        Self { modes: [mode; 3] }
    }

    pub fn with(mut self, probe: Probe, mode: ProbeMode) -> Self {
        self.modes[probe.index()] = mode;
        self
    }

    pub fn set(&mut self, probe: Probe, mode: ProbeMode) {
        self.modes[probe.index()] = mode;
    }

    pub fn mode(&self, probe: Probe) -> ProbeMode {
        self.modes[probe.index()]
    }

    /// Encodes the configuration into port register values.
    ///
    /// # Examples
    ///
    /// ```
    /// use component_tester::{Probe, ProbeConfig, ProbeMode};
    ///
    /// let registers = ProbeConfig::NEUTRAL
    ///     .with(Probe::One, ProbeMode::PullUpLow)
    ///     .with(Probe::Two, ProbeMode::DriveLow)
    ///     .registers();
    ///
    /// assert_eq!(registers.r_ddr, 0b0000_0001);
    /// assert_eq!(registers.r_port, 0b0000_0001);
    /// assert_eq!(registers.adc_ddr, 0b0000_0010);
    /// assert_eq!(registers.adc_port, 0);
    /// ```
    pub fn registers(&self) -> PortRegisters {
        let mut registers = PortRegisters::default();

        for probe in Probe::ALL {
            let pins = probe.pins();
            let adc_bit = 1 << pins.adc_channel;

            match self.mode(probe) {
                ProbeMode::Float => {}
                ProbeMode::DriveLow => registers.adc_ddr |= adc_bit,
                ProbeMode::DriveHigh => {
                    registers.adc_ddr |= adc_bit;
                    registers.adc_port |= adc_bit;
                }
                ProbeMode::PullUpLow => {
                    registers.r_ddr |= pins.rl_mask;
                    registers.r_port |= pins.rl_mask;
                }
                ProbeMode::PullDownLow => registers.r_ddr |= pins.rl_mask,
                ProbeMode::PullUpHigh => {
                    registers.r_ddr |= pins.rh_mask;
                    registers.r_port |= pins.rh_mask;
                }
                ProbeMode::PullDownHigh => registers.r_ddr |= pins.rh_mask,
            }
        }

        registers
    }
}

/// Roles of the probes for one hypothesis: the probe pulled or driven high,
/// the probe tied low, and the candidate base or gate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProbeAssignment {
    pub high: Probe,
    pub low: Probe,
    pub control: Probe,
}

impl ProbeAssignment {
    /// All six assignments, both orientations of a pair back to back.
    pub const ALL: [ProbeAssignment; 6] = [
        Self::new(Probe::One, Probe::Two, Probe::Three),
        Self::new(Probe::Two, Probe::One, Probe::Three),
        Self::new(Probe::One, Probe::Three, Probe::Two),
        Self::new(Probe::Three, Probe::One, Probe::Two),
        Self::new(Probe::Two, Probe::Three, Probe::One),
        Self::new(Probe::Three, Probe::Two, Probe::One),
    ];

    pub const fn new(high: Probe, low: Probe, control: Probe) -> Self {
        Self { high, low, control }
    }

    /// Same control probe, main terminals swapped.
    pub fn reversed(self) -> Self {
        Self::new(self.low, self.high, self.control)
    }
}

impl fmt::Display for ProbeAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.high, self.low, self.control)
    }
}
