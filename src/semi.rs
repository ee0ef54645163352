//! Three-terminal tests for one probe assignment: depletion FETs, bipolar
//! transistors, enhancement FETs, IGBTs, thyristors and triacs.

use embedded_hal::blocking::delay::{DelayMs, DelayUs};
use embedded_hal::watchdog::Watchdog;

use crate::error::Error;
use crate::hal::{CaptureTimer, Comparator, ProbePort};
use crate::probe::{Probe, ProbeAssignment, ProbeConfig, ProbeMode};
use crate::session::{
    Channel, ClassificationSession, FetMode, FetTechnology, Polarity, TransistorKind,
    TransistorRecord,
};
use crate::tester::Tester;
use crate::units::{current, Scaled};

const SETTLE_MS: u16 = 10;

/// Drop (mV) across Rl that counts as conduction.
const CONDUCTING_MV: u16 = 50;

const DEPLETION_MIN_MV: u16 = 50;
/// A self-biased source stays below this; more is a forward junction.
const DEPLETION_MAX_MV: u16 = 3500;
const DEPLETION_SWING_MV: u16 = 488;
/// A gate clamped this close (mV) to the source is a junction gate.
const JUNCTION_GATE_MV: u16 = 1000;

/// Rise (mV) of the collector drop when the base is switched on.
const SWITCHED_MV: u16 = 75;
/// Drop (mV) across the base resistor of a part that draws base current.
const BASE_CURRENT_MV: u16 = 1000;
const LEAKAGE_RH_MV: u16 = 10;

const THRESHOLD_RUNS: u32 = 10;
const THRESHOLD_POLLS: u32 = 2000;
const THRESHOLD_POLL_US: u16 = 5;
/// Low current drop (mV) of an IGBT's collector junction.
const IGBT_MV: u16 = 150;

const LATCHED_MV: u16 = 1000;

/// Source drops with the gate at the source rail and with the gate driven.
#[derive(Clone, Copy, Debug)]
struct Swing {
    off: u16,
    on: u16,
}

impl Swing {
    fn qualifies(self) -> bool {
        (DEPLETION_MIN_MV..=DEPLETION_MAX_MV).contains(&self.off)
            && self.on > self.off + DEPLETION_SWING_MV
    }

    fn change(self) -> u16 {
        self.on.saturating_sub(self.off)
    }
}

/// One half of the transistor test: the probes of an assignment wired as a
/// PNP / p-channel or as an NPN / n-channel part.
#[derive(Clone, Copy, Debug)]
struct Side {
    polarity: Polarity,
    collector: Probe,
    collector_mode: ProbeMode,
    emitter: Probe,
    emitter_mode: ProbeMode,
    base: Probe,
    off: ProbeMode,
    on: ProbeMode,
}

impl Side {
    fn new(polarity: Polarity, assignment: ProbeAssignment) -> Self {
        let ProbeAssignment { high, low, control } = assignment;

        match polarity {
            Polarity::Pnp => Self {
                polarity,
                collector: low,
                collector_mode: ProbeMode::PullDownLow,
                emitter: high,
                emitter_mode: ProbeMode::DriveHigh,
                base: control,
                off: ProbeMode::PullUpHigh,
                on: ProbeMode::PullDownHigh,
            },
            Polarity::Npn => Self {
                polarity,
                collector: high,
                collector_mode: ProbeMode::PullUpLow,
                emitter: low,
                emitter_mode: ProbeMode::DriveLow,
                base: control,
                off: ProbeMode::PullDownHigh,
                on: ProbeMode::PullUpHigh,
            },
        }
    }

    fn channel(&self) -> Channel {
        match self.polarity {
            Polarity::Pnp => Channel::P,
            Polarity::Npn => Channel::N,
        }
    }

    fn main(&self) -> ProbeConfig {
        ProbeConfig::NEUTRAL
            .with(self.collector, self.collector_mode)
            .with(self.emitter, self.emitter_mode)
    }

    fn with_base(&self, mode: ProbeMode) -> ProbeConfig {
        self.main().with(self.base, mode)
    }

    /// Modes that drive the base or gate hard on, and hard off.
    fn driven(&self) -> (ProbeMode, ProbeMode) {
        match self.polarity {
            Polarity::Pnp => (ProbeMode::DriveLow, ProbeMode::DriveHigh),
            Polarity::Npn => (ProbeMode::DriveHigh, ProbeMode::DriveLow),
        }
    }

    /// Emitter follower wiring: collector driven, emitter through Rl.
    fn follower(&self) -> (ProbeConfig, ProbeMode) {
        let (collector, emitter) = match self.polarity {
            Polarity::Pnp => (ProbeMode::DriveLow, ProbeMode::PullUpLow),
            Polarity::Npn => (ProbeMode::DriveHigh, ProbeMode::PullDownLow),
        };

        let config = ProbeConfig::NEUTRAL
            .with(self.collector, collector)
            .with(self.emitter, emitter);
        (config, emitter)
    }
}

impl<P, C, T, D, W> Tester<P, C, T, D, W>
where
    P: ProbePort,
    C: Comparator,
    T: CaptureTimer,
    D: DelayMs<u16> + DelayUs<u16>,
    W: Watchdog,
{
    /// Runs every test for one assignment and folds the findings into
    /// `session`.
    pub(crate) fn check_assignment(
        &mut self,
        session: &mut ClassificationSession,
        assignment: ProbeAssignment,
    ) -> Result<(), Error<P::Error>> {
        if session.done {
            return Ok(());
        }

        self.discharge_probes()?;
        let ProbeAssignment { high, low, .. } = assignment;

        if self.conducts(high, low)? {
            if let Some(fet) = self.depletion_fet(assignment)? {
                session.consider(fet);
            }
        }

        if !session.done {
            for polarity in [Polarity::Pnp, Polarity::Npn] {
                if let Some(candidate) = self.check_side(Side::new(polarity, assignment))? {
                    session.consider(candidate);
                    break;
                }
            }
        }

        if session.done {
            return Ok(());
        }

        self.discharge_probes()?;
        self.check_diode(session, high, low)?;
        self.check_resistor(session, high, low)
    }

    /// Drop (mV) across the resistor that ties `probe` to its rail in `mode`.
    fn rail_drop(&mut self, probe: Probe, mode: ProbeMode) -> Result<u16, Error<P::Error>> {
        let mv = self.voltage(probe)?;

        Ok(match mode {
            ProbeMode::DriveHigh | ProbeMode::PullUpLow | ProbeMode::PullUpHigh => {
                self.config.vcc_mv.saturating_sub(mv)
            }
            _ => mv,
        })
    }

    fn settled(&mut self, config: ProbeConfig) -> Result<(), Error<P::Error>> {
        self.apply(config)?;
        self.wait_ms(SETTLE_MS);
        Ok(())
    }

    /// Conduction from `high` to `low` with the third probe floating.
    fn conducts(&mut self, high: Probe, low: Probe) -> Result<bool, Error<P::Error>> {
        self.apply(
            ProbeConfig::NEUTRAL
                .with(high, ProbeMode::PullUpLow)
                .with(low, ProbeMode::DriveLow),
        )?;
        self.wait_ms(5);

        Ok(self.rail_drop(high, ProbeMode::PullUpLow)? > CONDUCTING_MV)
    }

    fn depletion_swing(
        &mut self,
        channel: Channel,
        drain: Probe,
        gate: Probe,
        source: Probe,
    ) -> Result<Swing, Error<P::Error>> {
        let (drain_mode, source_mode, off, on) = match channel {
            Channel::N => (
                ProbeMode::DriveHigh,
                ProbeMode::PullDownLow,
                ProbeMode::PullDownHigh,
                ProbeMode::PullUpHigh,
            ),
            Channel::P => (
                ProbeMode::DriveLow,
                ProbeMode::PullUpLow,
                ProbeMode::PullUpHigh,
                ProbeMode::PullDownHigh,
            ),
        };
        let main = ProbeConfig::NEUTRAL
            .with(drain, drain_mode)
            .with(source, source_mode);

        self.settled(main.with(gate, off))?;
        let off = self.rail_drop(source, source_mode)?;
        self.settled(main.with(gate, on))?;
        let on = self.rail_drop(source, source_mode)?;

        Ok(Swing { off, on })
    }

    /// Looks for a self-conducting FET in both channel polarities and both
    /// drain/source orientations.
    fn depletion_fet(
        &mut self,
        assignment: ProbeAssignment,
    ) -> Result<Option<TransistorRecord>, Error<P::Error>> {
        let ProbeAssignment { high, low, control } = assignment;

        for channel in [Channel::N, Channel::P] {
            let forward = self.depletion_swing(channel, high, control, low)?;
            let reverse = self.depletion_swing(channel, low, control, high)?;
            tracing::trace!(?channel, ?forward, ?reverse, "depletion swing");

            let (drain, source, swing) = match (forward.qualifies(), reverse.qualifies()) {
                (false, false) => continue,
                (true, false) => (high, low, forward),
                (false, true) => (low, high, reverse),
                (true, true) if reverse.change() > forward.change() => (low, high, reverse),
                (true, true) => (high, low, forward),
            };

            let technology = if self.junction_gate(channel, control, source)? {
                FetTechnology::Jfet
            } else {
                FetTechnology::Mosfet
            };

            let kind = TransistorKind::Fet {
                channel,
                mode: FetMode::Depletion,
                technology,
                symmetric: forward.qualifies() && reverse.qualifies(),
            };
            let mut record = TransistorRecord::new(kind, drain, control, source);
            record.cutoff_mv = Some(match channel {
                Channel::N => -(swing.off as i16),
                Channel::P => swing.off as i16,
            });

            tracing::debug!(?kind, %drain, gate = %control, %source, "depletion FET");
            return Ok(Some(record));
        }

        Ok(None)
    }

    /// A gate pulled towards the off rail is clamped near the source by a
    /// junction.
    fn junction_gate(
        &mut self,
        channel: Channel,
        gate: Probe,
        source: Probe,
    ) -> Result<bool, Error<P::Error>> {
        let (source_mode, gate_mode) = match channel {
            Channel::N => (ProbeMode::DriveLow, ProbeMode::PullUpHigh),
            Channel::P => (ProbeMode::DriveHigh, ProbeMode::PullDownHigh),
        };

        self.settled(
            ProbeConfig::NEUTRAL
                .with(source, source_mode)
                .with(gate, gate_mode),
        )?;
        let v_gate = self.voltage(gate)?;
        let v_source = self.voltage(source)?;

        Ok(v_gate.abs_diff(v_source) < JUNCTION_GATE_MV)
    }

    fn check_side(&mut self, side: Side) -> Result<Option<TransistorRecord>, Error<P::Error>> {
        self.settled(side.with_base(side.off))?;
        let u_off = self.rail_drop(side.collector, side.collector_mode)?;
        self.settled(side.with_base(side.on))?;
        let u_on = self.rail_drop(side.collector, side.collector_mode)?;
        let u_base = self.rail_drop(side.base, side.on)?;

        if u_on <= u_off + SWITCHED_MV {
            return match side.polarity {
                Polarity::Npn => self.thyristor(side),
                Polarity::Pnp => Ok(None),
            };
        }

        tracing::trace!(polarity = ?side.polarity, u_off, u_on, u_base, "switches");

        if u_base > BASE_CURRENT_MV {
            if side.polarity == Polarity::Npn {
                if let Some(thyristor) = self.thyristor(side)? {
                    return Ok(Some(thyristor));
                }
            }
            return self.bjt(side, u_on, u_base).map(Some);
        }

        self.enhancement(side).map(Some)
    }

    fn bjt(
        &mut self,
        side: Side,
        u_collector: u16,
        u_base: u16,
    ) -> Result<TransistorRecord, Error<P::Error>> {
        let r_collector = self.series_ohms(side.collector_mode) as u64;
        let r_base = self.series_ohms(side.on) as u64;

        let common_emitter = u_collector as u64 * r_base / (u_base as u64 * r_collector).max(1);

        let (follower, emitter_mode) = side.follower();
        self.settled(follower.with(side.base, side.on))?;
        let u_emitter = self.rail_drop(side.emitter, emitter_mode)? as u64;
        let u_base = self.rail_drop(side.base, side.on)? as u64;
        let r_emitter = self.series_ohms(emitter_mode) as u64;
        let common_collector =
            (u_emitter * r_base / (u_base * r_emitter).max(1)).saturating_sub(1);

        let hfe = common_emitter.max(common_collector) as u32;
        let leakage = self.collector_leakage(side)?;

        let kind = TransistorKind::Bjt {
            polarity: side.polarity,
            parasitic: false,
        };
        let mut record = TransistorRecord::new(kind, side.collector, side.base, side.emitter);
        record.hfe = Some(hfe);
        record.score = hfe;
        record.leakage = leakage;

        tracing::debug!(
            polarity = ?side.polarity,
            common_emitter,
            common_collector,
            base = %side.base,
            "bipolar transistor"
        );
        Ok(record)
    }

    /// I_CEO with the base open.
    fn collector_leakage(&mut self, side: Side) -> Result<Option<Scaled>, Error<P::Error>> {
        let (follower, emitter_mode) = side.follower();
        self.settled(follower)?;
        let mv = self.rail_drop(side.emitter, emitter_mode)?;
        if mv >= LEAKAGE_RH_MV {
            return Ok(current(mv, self.series_ohms(emitter_mode)));
        }

        let sensitive = match side.polarity {
            Polarity::Pnp => ProbeMode::PullUpHigh,
            Polarity::Npn => ProbeMode::PullDownHigh,
        };
        self.settled(follower.with(side.emitter, sensitive))?;
        let mv = self.rail_drop(side.emitter, sensitive)?;

        Ok(current(mv, self.series_ohms(sensitive)))
    }

    /// Enhancement MOSFET or IGBT with the gate on `side.base`.
    fn enhancement(&mut self, side: Side) -> Result<TransistorRecord, Error<P::Error>> {
        let threshold = self.gate_threshold(side)?;
        let (gate_on, _) = side.driven();
        let channel = side.channel();

        let weak = match side.polarity {
            Polarity::Pnp => ProbeMode::PullDownHigh,
            Polarity::Npn => ProbeMode::PullUpHigh,
        };
        self.settled(side.with_base(gate_on).with(side.collector, weak))?;
        let low_current = self.voltage(side.collector)?.abs_diff(self.voltage(side.emitter)?);

        self.settled(side.with_base(gate_on))?;
        let across = self.voltage(side.collector)?.abs_diff(self.voltage(side.emitter)?);
        let u_collector = self.rail_drop(side.collector, side.collector_mode)?;

        let mut record = if low_current > IGBT_MV {
            let mut record = TransistorRecord::new(
                TransistorKind::Igbt { channel },
                side.collector,
                side.base,
                side.emitter,
            );
            record.v_on = Some(across);
            record
        } else {
            let kind = TransistorKind::Fet {
                channel,
                mode: FetMode::Enhancement,
                technology: FetTechnology::Mosfet,
                symmetric: false,
            };
            let mut record = TransistorRecord::new(kind, side.collector, side.base, side.emitter);
            // mV / mA in mΩ
            let r_collector = self.series_ohms(side.collector_mode) as u64;
            let milliohms = across as u64 * r_collector * 1000 / (u_collector as u64).max(1);
            record.r_ds_on = Some(Scaled::from_wide(milliohms, -3));
            record
        };

        record.threshold_mv = threshold;
        tracing::debug!(kind = ?record.kind, ?threshold, low_current, across, "enhancement part");
        Ok(record)
    }

    /// Charges the gate through Rh until the drain switches, then floats the
    /// gate and reads the gate-source voltage. Averages over several runs.
    fn gate_threshold(&mut self, side: Side) -> Result<Option<i16>, Error<P::Error>> {
        let (_, gate_off) = side.driven();
        let main = side.main();

        self.comparator.select(side.collector);

        let mut sum = 0i32;
        let mut runs = 0i32;
        for _ in 0..THRESHOLD_RUNS {
            self.feed();
            self.apply(main.with(side.base, gate_off))?;
            self.wait_ms(1);
            self.apply(main.with(side.base, side.on))?;

            let mut switched = false;
            for _ in 0..THRESHOLD_POLLS {
                self.wait_us(THRESHOLD_POLL_US);
                let above = self.comparator.is_above_reference();
                switched = match side.polarity {
                    Polarity::Npn => !above,
                    Polarity::Pnp => above,
                };
                if switched {
                    break;
                }
            }

            self.apply(main)?;
            if !switched {
                continue;
            }

            let v_gate = self.voltage(side.base)? as i32;
            let v_source = self.voltage(side.emitter)? as i32;
            sum += v_gate - v_source;
            runs += 1;
        }

        self.comparator.disable();

        if runs == 0 {
            return Ok(None);
        }
        Ok(Some((sum / runs) as i16))
    }

    /// Thyristor test with `side.collector` as anode, `side.emitter` as
    /// cathode and `side.base` as gate, followed by the triac test.
    fn thyristor(&mut self, side: Side) -> Result<Option<TransistorRecord>, Error<P::Error>> {
        let (anode, gate, cathode) = (side.collector, side.base, side.emitter);
        let main = ProbeConfig::NEUTRAL
            .with(anode, ProbeMode::PullUpLow)
            .with(cathode, ProbeMode::DriveLow);

        self.settled(main.with(gate, ProbeMode::PullDownLow))?;
        if self.rail_drop(anode, ProbeMode::PullUpLow)? > CONDUCTING_MV {
            return Ok(None);
        }

        self.settled(main.with(gate, ProbeMode::PullUpLow))?;
        let trigger = self.voltage(gate)?.saturating_sub(self.voltage(cathode)?);

        self.settled(main)?;
        if self.rail_drop(anode, ProbeMode::PullUpLow)? < LATCHED_MV {
            return Ok(None);
        }
        let v_on = self.voltage(anode)?.saturating_sub(self.voltage(cathode)?);

        // interrupting the anode current has to turn it off
        self.settled(ProbeConfig::NEUTRAL.with(cathode, ProbeMode::DriveLow))?;
        self.settled(main)?;
        if self.rail_drop(anode, ProbeMode::PullUpLow)? > CONDUCTING_MV {
            return Ok(None);
        }

        let kind = if self.triac_latches(anode, gate, cathode)? {
            TransistorKind::Triac
        } else {
            TransistorKind::Thyristor
        };

        let mut record = TransistorRecord::new(kind, anode, gate, cathode);
        record.v_on = Some(v_on);
        record.gate_trigger_mv = Some(trigger);

        tracing::debug!(?kind, %anode, %gate, %cathode, v_on, trigger, "latching part");
        Ok(Some(record))
    }

    /// Triggers with the main terminals reversed and a negative gate current.
    fn triac_latches(
        &mut self,
        anode: Probe,
        gate: Probe,
        cathode: Probe,
    ) -> Result<bool, Error<P::Error>> {
        let reverse = ProbeConfig::NEUTRAL
            .with(cathode, ProbeMode::DriveHigh)
            .with(anode, ProbeMode::PullDownLow);

        self.settled(reverse.with(gate, ProbeMode::PullDownLow))?;
        self.settled(reverse)?;
        let latched = self.rail_drop(anode, ProbeMode::PullDownLow)? > LATCHED_MV;

        self.settled(ProbeConfig::NEUTRAL)?;
        Ok(latched)
    }
}
