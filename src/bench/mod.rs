//! A simulated tester for the unit tests: the probe port, comparator,
//! capture timer, delay and watchdog of one instrument wired to a
//! [`Circuit`].


use std::cell::RefCell;
use std::rc::Rc;

use embedded_hal::blocking::delay::{DelayMs, DelayUs};
use embedded_hal::watchdog::Watchdog;

pub use circuit::{Circuit, Driver, Element, GROUND, RI_HIGH, RI_LOW, R_HIGH, R_LOW, VCC, VT};

use crate::config::{Calibration, Config};
use crate::hal::{CaptureTimer, Comparator, ProbePort, Reference};
use crate::probe::{Probe, ProbeConfig, ProbeMode};
use crate::session::Channel;
use crate::tester::Tester;

const CONVERSION_TIME: f64 = 100e-6;
const POLL_TICKS: u64 = 4096;
/// Step bounds while the capture timer runs. Steps grow with the elapsed
/// time so that stray capacitances are resolved during short captures.
const CAPTURE_STEPS: f64 = 256.0;
const MIN_CAPTURE_STEP: f64 = 0.25e-6;
const MAX_CAPTURE_STEP: f64 = 1e-3;
const STRAY_CAPACITANCE: f64 = 20e-12;

/// Stray capacitance of a probe in pF, for the bench calibration.
pub const STRAY_PF: u16 = 20;

pub type BenchTester = Tester<Port, Analog, Timer, Clock, Dog>;

/// Prints the measurement events of a test with `--nocapture`.
pub fn trace() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

#[derive(Debug)]
struct TimerState {
    running: bool,
    start: f64,
    end: Option<f64>,
    captured: Option<u64>,
    last_above: bool,
}

#[derive(Debug)]
struct State {
    circuit: Circuit,
    bandgap: f64,
    comparator_offset: f64,
    noise: i32,
    seed: u32,
    selected: Option<Probe>,
    timer: TimerState,
    clock_hz: f64,
    /// The overflow interrupt has not yet counted an overflow that happened
    /// shortly before a capture.
    miss_overflow: bool,
    feeds: usize,
    conversions: usize,
}

impl State {
    fn node(probe: Probe) -> usize {
        probe.index() + 1
    }

    fn random(&mut self) -> i32 {
        self.seed = self.seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        ((self.seed >> 16) & 0x7fff) as i32
    }

    fn above(&self) -> bool {
        self.selected.is_some_and(|probe| {
            self.circuit.voltage(Self::node(probe)) > self.bandgap + self.comparator_offset
        })
    }

    fn ticks(&self, until: f64) -> u64 {
        ((until - self.timer.start) * self.clock_hz).round().max(0.0) as u64
    }

    fn advance(&mut self, seconds: f64) {
        self.circuit.advance(seconds);
    }

    /// Advances in steps short against the time since the timer started.
    fn advance_timed(&mut self, seconds: f64) {
        let end = self.circuit.time + seconds;

        while end - self.circuit.time > 1e-12 {
            let elapsed = self.circuit.time - self.timer.start;
            let step = (elapsed / CAPTURE_STEPS)
                .clamp(MIN_CAPTURE_STEP, MAX_CAPTURE_STEP)
                .min(end - self.circuit.time);
            self.circuit.advance(step);
        }
    }

    /// The capture fell into the lower half of the counter right after an
    /// overflow that is still pending.
    fn overflow_missed(&self) -> bool {
        self.miss_overflow
            && self
                .timer
                .captured
                .is_some_and(|ticks| ticks >= 0x1_0000 && ticks & 0xffff < 0x8000)
    }
}

/// A tester with a part connected, simulated.
#[derive(Clone, Debug)]
pub struct Bench {
    state: Rc<RefCell<State>>,
}

impl Default for Bench {
    fn default() -> Self {
        Self::new()
    }
}

impl Bench {
    pub fn new() -> Self {
        let mut circuit = Circuit::new(4);

        for probe in Probe::ALL {
            let node = State::node(probe);
            circuit.elements.push(Element::Clamp { node });
            circuit.elements.push(Element::Capacitor {
                a: node,
                b: GROUND,
                farads: STRAY_CAPACITANCE,
                volts: 0.0,
            });
        }

        let state = State {
            circuit,
            bandgap: 1.1,
            comparator_offset: 0.0,
            noise: 0,
            seed: 1,
            selected: None,
            timer: TimerState {
                running: false,
                start: 0.0,
                end: None,
                captured: None,
                last_above: false,
            },
            clock_hz: Config::default().clock_hz as f64,
            miss_overflow: false,
            feeds: 0,
            conversions: 0,
        };

        Self {
            state: Rc::new(RefCell::new(state)),
        }
    }

    /// Calibration matching the bench hardware.
    pub fn calibration() -> Calibration {
        let mut calibration = Calibration::default();
        calibration.cap_zero = STRAY_PF;
        calibration
    }

    pub fn tester(&self) -> BenchTester {
        self.tester_with(Config::default(), Self::calibration())
    }

    pub fn tester_with(&self, config: Config, calibration: Calibration) -> BenchTester {
        self.state.borrow_mut().clock_hz = config.clock_hz as f64;

        Tester::new(
            Port(self.state.clone()),
            Analog(self.state.clone()),
            Timer(self.state.clone()),
            Clock(self.state.clone()),
            Dog(self.state.clone()),
            config,
            calibration,
        )
    }

    /// Adds up to `lsb` codes of noise to every conversion.
    pub fn noise(&self, lsb: i32) {
        self.state.borrow_mut().noise = lsb;
    }

    pub fn bandgap(&self, volts: f64) {
        self.state.borrow_mut().bandgap = volts;
    }

    pub fn comparator_offset(&self, volts: f64) {
        self.state.borrow_mut().comparator_offset = volts;
    }

    /// Leaves the last overflow before a capture to be reported as pending.
    pub fn miss_overflow(&self, missed: bool) {
        self.state.borrow_mut().miss_overflow = missed;
    }

    pub fn voltage(&self, probe: Probe) -> f64 {
        self.state.borrow().circuit.voltage(State::node(probe))
    }

    pub fn time(&self) -> f64 {
        self.state.borrow().circuit.time
    }

    pub fn feeds(&self) -> usize {
        self.state.borrow().feeds
    }

    pub fn drivers(&self) -> [Option<Driver>; 3] {
        self.state.borrow().circuit.drivers
    }

    fn add(&self, element: Element) {
        self.state.borrow_mut().circuit.elements.push(element);
    }

    fn internal_node(&self) -> usize {
        self.state.borrow_mut().circuit.add_node()
    }

    pub fn resistor(&self, a: Probe, b: Probe, ohms: f64) {
        self.add(Element::Resistor {
            a: State::node(a),
            b: State::node(b),
            ohms,
        });
    }

    pub fn capacitor(&self, a: Probe, b: Probe, farads: f64) {
        self.charged_capacitor(a, b, farads, 0.0);
    }

    pub fn charged_capacitor(&self, a: Probe, b: Probe, farads: f64, volts: f64) {
        self.add(Element::Capacitor {
            a: State::node(a),
            b: State::node(b),
            farads,
            volts,
        });
    }

    /// An inductor with its winding resistance.
    pub fn inductor(&self, a: Probe, b: Probe, henries: f64, ohms: f64) {
        let x = self.internal_node();
        self.add(Element::Resistor {
            a: State::node(a),
            b: x,
            ohms,
        });
        self.add(Element::Inductor {
            a: x,
            b: State::node(b),
            henries,
            amps: 0.0,
        });
    }

    /// A diode with a forward voltage of `vf` at 6 mA.
    pub fn diode(&self, anode: Probe, cathode: Probe, vf: f64) {
        self.junction(State::node(anode), State::node(cathode), vf);
    }

    fn junction(&self, anode: usize, cathode: usize, vf: f64) {
        self.add(Element::Diode {
            anode,
            cathode,
            is: 6e-3 / ((vf / VT).exp() - 1.0),
            n: 1.0,
        });
    }

    pub fn npn(&self, c: Probe, b: Probe, e: Probe, beta: f64) {
        self.bjt(1.0, c, b, e, beta);
    }

    pub fn pnp(&self, c: Probe, b: Probe, e: Probe, beta: f64) {
        self.bjt(-1.0, c, b, e, beta);
    }

    fn bjt(&self, sign: f64, c: Probe, b: Probe, e: Probe, beta: f64) {
        self.add(Element::Bjt {
            sign,
            c: State::node(c),
            b: State::node(b),
            e: State::node(e),
            beta_f: beta,
            beta_r: 5.0,
            is: 1e-14,
        });
    }

    fn sign(channel: Channel) -> f64 {
        match channel {
            Channel::N => 1.0,
            Channel::P => -1.0,
        }
    }

    /// A MOSFET with a body diode and 1 nF of gate capacitance. `vth` is the
    /// threshold magnitude, negative for depletion mode parts.
    pub fn mosfet(&self, channel: Channel, vth: f64, d: Probe, g: Probe, s: Probe) {
        let (d, g, s) = (State::node(d), State::node(g), State::node(s));
        self.add(Element::Mosfet {
            sign: Self::sign(channel),
            d,
            g,
            s,
            vth,
            k: 1.0,
        });
        self.add(Element::Capacitor {
            a: g,
            b: s,
            farads: 1e-9,
            volts: 0.0,
        });
        match channel {
            Channel::N => self.junction(s, d, 0.7),
            Channel::P => self.junction(d, s, 0.7),
        }
    }

    /// A JFET with a pinch-off voltage of 2 V and an Idss of 10 mA.
    pub fn jfet(&self, channel: Channel, d: Probe, g: Probe, s: Probe) {
        let (d, g, s) = (State::node(d), State::node(g), State::node(s));
        self.add(Element::Jfet {
            sign: Self::sign(channel),
            d,
            g,
            s,
            vp: -2.0,
            idss: 10e-3,
        });
        for channel_end in [d, s] {
            match channel {
                Channel::N => self.junction(g, channel_end, 0.7),
                Channel::P => self.junction(channel_end, g, 0.7),
            }
        }
    }

    /// An IGBT with a 3 V threshold: a MOSFET channel behind the collector
    /// junction.
    pub fn igbt(&self, channel: Channel, c: Probe, g: Probe, e: Probe) {
        let (c, g, e) = (State::node(c), State::node(g), State::node(e));
        let x = self.internal_node();
        match channel {
            Channel::N => self.junction(c, x, 0.7),
            Channel::P => self.junction(x, c, 0.7),
        }
        self.add(Element::Mosfet {
            sign: Self::sign(channel),
            d: x,
            g,
            s: e,
            vth: 3.0,
            k: 1.0,
        });
        self.add(Element::Capacitor {
            a: g,
            b: e,
            farads: 2e-9,
            volts: 0.0,
        });
    }

    pub fn thyristor(&self, a: Probe, g: Probe, k: Probe) {
        let (a, g, k) = (State::node(a), State::node(g), State::node(k));
        self.add(Element::Thyristor {
            a,
            g,
            k,
            latched: false,
            bidirectional: false,
        });
        self.junction(g, k, 0.65);
    }

    pub fn triac(&self, mt2: Probe, g: Probe, mt1: Probe) {
        let (mt2, g, mt1) = (State::node(mt2), State::node(g), State::node(mt1));
        self.add(Element::Thyristor {
            a: mt2,
            g,
            k: mt1,
            latched: false,
            bidirectional: true,
        });
        self.junction(g, mt1, 0.65);
        self.junction(mt1, g, 0.65);
    }

    pub fn battery(&self, plus: Probe, minus: Probe, volts: f64) {
        self.add(Element::Source {
            plus: State::node(plus),
            minus: State::node(minus),
            volts,
            ohms: 0.5,
        });
    }
}

fn driver(mode: ProbeMode) -> Option<Driver> {
    let (ohms, target) = match mode {
        ProbeMode::Float => return None,
        ProbeMode::DriveLow => (RI_LOW, 0.0),
        ProbeMode::DriveHigh => (RI_HIGH, VCC),
        ProbeMode::PullUpLow => (R_LOW + RI_HIGH, VCC),
        ProbeMode::PullDownLow => (R_LOW + RI_LOW, 0.0),
        ProbeMode::PullUpHigh => (R_HIGH + RI_HIGH, VCC),
        ProbeMode::PullDownHigh => (R_HIGH + RI_LOW, 0.0),
    };

    Some(Driver {
        conductance: 1.0 / ohms,
        target,
    })
}

#[derive(Debug)]
pub struct Port(Rc<RefCell<State>>);

impl ProbePort for Port {
    type Error = core::convert::Infallible;

    fn configure(&mut self, config: &ProbeConfig) -> Result<(), Self::Error> {
        let mut state = self.0.borrow_mut();
        for probe in Probe::ALL {
            state.circuit.drivers[probe.index()] = driver(config.mode(probe));
        }
        Ok(())
    }

    fn convert(&mut self, probe: Probe, reference: Reference) -> nb::Result<u16, Self::Error> {
        let mut state = self.0.borrow_mut();
        state.advance(CONVERSION_TIME);
        state.conversions += 1;

        let full_scale = match reference {
            Reference::Supply => VCC,
            Reference::Bandgap => state.bandgap,
        };
        let volts = state.circuit.voltage(State::node(probe));
        let mut code = (volts / full_scale * 1024.0).floor() as i32;

        if state.noise > 0 {
            let span = 2 * state.noise + 1;
            code += state.random() % span - state.noise;
        }

        Ok(code.clamp(0, 1023) as u16)
    }
}

#[derive(Debug)]
pub struct Analog(Rc<RefCell<State>>);

impl Comparator for Analog {
    fn select(&mut self, probe: Probe) {
        self.0.borrow_mut().selected = Some(probe);
    }

    fn is_above_reference(&mut self) -> bool {
        self.0.borrow().above()
    }

    fn disable(&mut self) {
        self.0.borrow_mut().selected = None;
    }
}

#[derive(Debug)]
pub struct Timer(Rc<RefCell<State>>);

impl CaptureTimer for Timer {
    fn start(&mut self) {
        let mut state = self.0.borrow_mut();
        let above = state.above();
        let start = state.circuit.time;
        state.timer = TimerState {
            running: true,
            start,
            end: None,
            captured: None,
            last_above: above,
        };
    }

    fn stop(&mut self) {
        let mut state = self.0.borrow_mut();
        if state.timer.running {
            let now = state.circuit.time;
            state.timer.running = false;
            state.timer.end = Some(now);
        }
    }

    fn capture(&mut self) -> Option<u16> {
        let mut state = self.0.borrow_mut();

        if let Some(ticks) = state.timer.captured {
            return Some(ticks as u16);
        }
        if !state.timer.running {
            return None;
        }

        let tick = 1.0 / state.clock_hz;
        let snapshot = state.circuit.clone();
        state.advance_timed(POLL_TICKS as f64 * tick);

        let above = state.above();
        let rising = above && !state.timer.last_above;
        state.timer.last_above = above;

        if !rising {
            return None;
        }

        // first tick of the poll interval with the input above the reference
        let (mut low, mut high) = (0, POLL_TICKS);
        while high - low > 1 {
            let middle = (low + high) / 2;
            state.circuit = snapshot.clone();
            state.advance_timed(middle as f64 * tick);
            if state.above() {
                high = middle;
            } else {
                low = middle;
            }
        }

        state.circuit = snapshot;
        state.advance_timed(high as f64 * tick);

        let now = state.circuit.time;
        let ticks = state.ticks(now);
        state.timer.captured = Some(ticks);
        state.timer.running = false;
        state.timer.end = Some(now);

        Some(ticks as u16)
    }

    fn overflows(&self) -> u32 {
        let state = self.0.borrow();
        let ticks = match state.timer.captured {
            Some(ticks) => ticks,
            None => state.ticks(state.timer.end.unwrap_or(state.circuit.time)),
        };
        (ticks >> 16) as u32 - state.overflow_missed() as u32
    }

    fn overflow_pending(&self) -> bool {
        self.0.borrow().overflow_missed()
    }
}

#[derive(Debug)]
pub struct Clock(Rc<RefCell<State>>);

impl DelayMs<u16> for Clock {
    fn delay_ms(&mut self, ms: u16) {
        self.0.borrow_mut().advance(ms as f64 * 1e-3);
    }
}

impl DelayUs<u16> for Clock {
    fn delay_us(&mut self, us: u16) {
        self.0.borrow_mut().advance(us as f64 * 1e-6);
    }
}

#[derive(Debug)]
pub struct Dog(Rc<RefCell<State>>);

impl Watchdog for Dog {
    fn feed(&mut self) {
        self.0.borrow_mut().feeds += 1;
    }
}
