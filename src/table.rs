use crate::config::{Calibration, Config};
use crate::interpolate::interpolate;

/// A table of `(key, factor)` pairs sampled from a closed-form function at
/// evenly spaced keys, read back with linear interpolation.
///
/// # Examples
///
/// ```
/// use component_tester::FactorTable;
///
/// let table = FactorTable::<3>::from_fn(100, 100, |key| 1_000_000 / key);
///
/// assert_eq!(table.lookup(100), Some(10_000));
/// assert_eq!(table.lookup(150), Some(7_500));
/// assert_eq!(table.lookup(301), None);
/// ```
#[derive(Clone, Debug)]
pub struct FactorTable<const LENGTH: usize> {
    table: [(u32, u32); LENGTH],
}

impl<const LENGTH: usize> FactorTable<LENGTH> {
    /// Samples `factor` at `start`, `start + step`, ... for `LENGTH` keys.
    pub fn from_fn<F>(start: u32, step: u32, factor: F) -> Self
    where
        F: Fn(u32) -> u32,
    {
        let mut table = [(0, 0); LENGTH];

        for (index, entry) in table.iter_mut().enumerate() {
            let key = start + index as u32 * step;
            *entry = (key, factor(key));
        }

        debug_assert!(
            table.windows(2).all(|w| w[0].0 < w[1].0),
            "Table keys must be ascending"
        );

        Self { table }
    }

    /// Returns the interpolated factor for `key`, or `None` if `key` falls
    /// outside the table.
    pub fn lookup(&self, key: u32) -> Option<u32> {
        self.table.iter().enumerate().find_map(|(index, (x0, y0))| {
            let (x1, y1) = self.table.get(index + 1)?;

            if key >= *x0 && key <= *x1 {
                Some(interpolate(*x0, *x1, *y0, *y1, key))
            } else {
                None
            }
        })
    }

    /// Smallest key covered by the table.
    pub fn first_key(&self) -> u32 {
        self.table.first().map_or(0, |entry| entry.0)
    }

    /// Largest key covered by the table.
    pub fn last_key(&self) -> u32 {
        self.table.last().map_or(0, |entry| entry.0)
    }
}

pub const LARGE_CAP_ENTRIES: usize = 45;
pub const SMALL_CAP_ENTRIES: usize = 17;
pub const INDUCTOR_ENTRIES: usize = 39;

/// The conversion tables of the measurement engines.
///
/// - `large_cap`: charge voltage (mV, 300–1400) to nF per millisecond of
///   charging through Rl and both pin resistances.
/// - `small_cap`: comparator threshold (mV, 900–1300) to fF per timer tick
///   of charging through Rh.
/// - `inductor`: threshold-to-final-voltage ratio (‰, 25–975) to the time
///   constant factor, scaled by 1000.
#[derive(Clone, Debug)]
pub struct Tables {
    pub large_cap: FactorTable<LARGE_CAP_ENTRIES>,
    pub small_cap: FactorTable<SMALL_CAP_ENTRIES>,
    pub inductor: FactorTable<INDUCTOR_ENTRIES>,
}

impl Tables {
    pub fn new(config: &Config, calibration: &Calibration) -> Self {
        let vcc = config.vcc_mv as f64;

        // -ln(1 - U/Vcc)
        let charge_log = |mv: u32| -libm::log(1.0 - mv as f64 / vcc);

        let r_large = config.r_low as f64
            + (calibration.ri_high as f64 + calibration.ri_low as f64) / 10.0;
        let large_cap = FactorTable::from_fn(300, 25, |mv| {
            // C[nF] = t[ms] * 1e6 / (R * -ln(1 - U/Vcc))
            libm::round(1.0e6 / (r_large * charge_log(mv))) as u32
        });

        let r_small = config.r_high as f64;
        let clock = config.clock_hz as f64;
        let small_cap = FactorTable::from_fn(900, 25, |mv| {
            // C[fF] = ticks * 1e15 / (f * R * -ln(1 - U/Vcc))
            libm::round(1.0e15 / (clock * r_small * charge_log(mv))) as u32
        });

        let inductor = FactorTable::from_fn(25, 25, |ratio| {
            libm::round(-1000.0 / libm::log(1.0 - ratio as f64 / 1000.0)) as u32
        });

        Self {
            large_cap,
            small_cap,
            inductor,
        }
    }
}
