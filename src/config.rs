use thiserror::Error;

/// Fixed properties of the tester hardware.
///
/// - `vcc_mv`: supply voltage, also the ADC's supply reference (mV)
/// - `bandgap_mv`: nominal internal bandgap reference (mV)
/// - `adc_range`: number of ADC codes (eg. for a 10-bit ADC, use `1024`)
/// - `r_low`: the "low" probe resistor Rl (Ω)
/// - `r_high`: the "high" probe resistor Rh (Ω)
/// - `clock_hz`: capture timer clock (Hz)
/// - `samples`: ADC conversions averaged by a regular voltage reading
/// - `large_cap_correction`: empirical correction of the pulse-counting
///   capacitance method (‰)
///
/// # Examples
///
/// ```
/// use component_tester::Config;
///
/// let config = Config {
///     r_low: 470,
///     r_high: 1_000_000,
///     clock_hz: 16_000_000,
///     ..Config::default()
/// };
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub vcc_mv: u16,
    pub bandgap_mv: u16,
    pub adc_range: u16,
    pub r_low: u32,
    pub r_high: u32,
    pub clock_hz: u32,
    pub samples: u8,
    pub large_cap_correction: LargeCapCorrection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vcc_mv: 5000,
            bandgap_mv: 1100,
            adc_range: 1024,
            r_low: 680,
            r_high: 470_000,
            clock_hz: 8_000_000,
            samples: 25,
            large_cap_correction: LargeCapCorrection::default(),
        }
    }
}

/// Systematic error of the pulse-counting method, by pulse width (‰ added).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LargeCapCorrection {
    pub pulse_10ms: u16,
    pub pulse_1ms: u16,
}

impl Default for LargeCapCorrection {
    fn default() -> Self {
        Self {
            pulse_10ms: 90,
            pulse_1ms: 40,
        }
    }
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum CalibrationError {
    #[error("offset of {0} mV is outside the accepted range")]
    OutOfRange(i16),
}

/// Adjustment values of an individual tester.
///
/// The caller loads these from non-volatile storage at startup and may store
/// them again after a run, since the capacitance engine refines the two
/// offsets opportunistically.
///
/// - `ri_low`, `ri_high`: output resistance of a port pin driving low/high (0.1 Ω)
/// - `r_zero`: resistance of the probe leads (0.01 Ω)
/// - `cap_zero`: stray capacitance of the probe leads (pF)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Calibration {
    pub ri_low: u16,
    pub ri_high: u16,
    pub r_zero: u16,
    pub cap_zero: u16,
    ref_offset: i8,
    comp_offset: i8,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            ri_low: 190,
            ri_high: 220,
            r_zero: 0,
            cap_zero: 0,
            ref_offset: 0,
            comp_offset: 0,
        }
    }
}

impl Calibration {
    /// Largest accepted magnitude of either offset (mV).
    pub const OFFSET_LIMIT_MV: i16 = 50;

    /// Offset of the real bandgap voltage from its nominal value (mV).
    pub fn ref_offset(&self) -> i8 {
        self.ref_offset
    }

    /// Offset of the analog comparator's switching point (mV).
    pub fn comp_offset(&self) -> i8 {
        self.comp_offset
    }

    pub fn set_ref_offset(&mut self, mv: i16) -> Result<(), CalibrationError> {
        self.ref_offset = Self::bounded(mv)?;
        Ok(())
    }

    pub fn set_comp_offset(&mut self, mv: i16) -> Result<(), CalibrationError> {
        self.comp_offset = Self::bounded(mv)?;
        Ok(())
    }

    fn bounded(mv: i16) -> Result<i8, CalibrationError> {
        if mv.abs() > Self::OFFSET_LIMIT_MV {
            return Err(CalibrationError::OutOfRange(mv));
        }

        Ok(mv as i8)
    }
}
