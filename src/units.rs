use core::cmp::Ordering;
use core::fmt;

/// An integer quantity with a power-of-ten exponent.
///
/// The physical value is `value * 10^exponent` in the base unit (ohm, farad,
/// henry, ampere).
///
/// # Examples
///
/// ```
/// use component_tester::Scaled;
///
/// // 4.7 kΩ stored in tenths of an ohm
/// let r = Scaled::new(47_000, -1);
///
/// assert_eq!(r.to_exponent(0), Some(4_700));
/// assert_eq!(r.to_exponent(3), Some(4));
/// ```
#[derive(Clone, Copy, Debug)]
pub struct Scaled {
    pub value: u32,
    pub exponent: i8,
}

impl Scaled {
    pub const fn new(value: u32, exponent: i8) -> Self {
        Self { value, exponent }
    }

    /// Builds a value from a wide intermediate result, dropping decimal
    /// digits until it fits into `u32`.
    pub fn from_wide(mut value: u64, mut exponent: i8) -> Self {
        while value > u32::MAX as u64 {
            value /= 10;
            exponent += 1;
        }

        Self {
            value: value as u32,
            exponent,
        }
    }

    /// Returns the value expressed with `exponent`, truncating digits when the
    /// exponent grows. Returns `None` on overflow.
    pub fn to_exponent(self, exponent: i8) -> Option<u64> {
        let shift = self.exponent as i32 - exponent as i32;

        if shift >= 0 {
            10u64
                .checked_pow(shift as u32)
                .and_then(|factor| (self.value as u64).checked_mul(factor))
        } else {
            let divisor = 10u64.checked_pow((-shift) as u32)?;
            Some(self.value as u64 / divisor)
        }
    }

    /// Approximate value in the base unit, for diagnostics and display.
    pub fn as_f32(self) -> f32 {
        self.value as f32 * libm::powf(10.0, self.exponent as f32)
    }

    fn widened(self, exponent: i8) -> u128 {
        let shift = (self.exponent as i32 - exponent as i32) as u32;
        self.value as u128 * 10u128.pow(shift)
    }
}

/// Current through `ohms` with `mv` across it, in amperes. `None` when
/// nothing flows.
pub(crate) fn current(mv: u16, ohms: u32) -> Option<Scaled> {
    if mv == 0 || ohms == 0 {
        return None;
    }

    // mV / Ω in nA
    let na = mv as u64 * 1_000_000 / ohms as u64;
    Some(Scaled::from_wide(na, -9))
}

impl PartialEq for Scaled {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scaled {}

impl PartialOrd for Scaled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scaled {
    fn cmp(&self, other: &Self) -> Ordering {
        let exponent = self.exponent.min(other.exponent);
        self.widened(exponent).cmp(&other.widened(exponent))
    }
}

impl fmt::Display for Scaled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}e{}", self.value, self.exponent)
    }
}
