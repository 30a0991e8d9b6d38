// Frame clock pacing and config-driven frame rates, on a simulated monotonic clock.

use std::cell::{Cell, RefCell};

use scanout::{
    DisplayError, ErrorKind, FrameClock,
    clock::{MonotonicClock, NANOS_PER_SEC},
    config::{self, DisplayConfig},
};

#[derive(Debug, Default)]
struct SimulatedClock {
    now: Cell<u64>,
    wakeups: RefCell<Vec<u64>>,
}

impl MonotonicClock for &SimulatedClock {
    fn now_ns(&self) -> u64 {
        self.now.get()
    }

    fn sleep_until_ns(&self, deadline_ns: u64) {
        self.now.set(self.now.get().max(deadline_ns));
        self.wakeups.borrow_mut().push(self.now.get());
    }
}

#[test]
fn one_second_of_frames_takes_one_second() {
    let sim = SimulatedClock::default();
    sim.now.set(42);
    let mut clock = FrameClock::with_source(50.0, &sim).unwrap();
    clock.tick();
    let start = sim.now.get();
    assert_eq!(start, 42 + 20_000_000);

    for _ in 0..50 {
        // Some render work that always fits in the frame budget.
        sim.now.set(sim.now.get() + 3_000_000);
        clock.tick();
    }

    assert_eq!(sim.now.get(), start + NANOS_PER_SEC);
    let wakeups = sim.wakeups.borrow();
    assert!(wakeups.windows(2).all(|w| w[1] - w[0] == 20_000_000));
}

#[test]
fn slow_frame_is_absorbed_by_later_ones() {
    let sim = SimulatedClock::default();
    let mut clock = FrameClock::with_source(100.0, &sim).unwrap();

    clock.tick();
    sim.now.set(sim.now.get() + 15_000_000);
    clock.tick();
    clock.tick();

    // Second deadline was missed; the third is still on the 10ms grid.
    assert_eq!(*sim.wakeups.borrow(), vec![10_000_000, 25_000_000, 30_000_000]);
}

#[test]
fn configured_rate_drives_the_clock() {
    let mut config = DisplayConfig::default();
    config::apply_overrides(&mut config, |key| {
        (key == "SCANOUT_FPS").then(|| "144".to_owned())
    })
    .unwrap();

    let sim = SimulatedClock::default();
    let clock = FrameClock::with_source(config.fps, &sim).unwrap();
    assert_eq!(clock.interval_ns(), 6_944_444);
}

#[test]
fn zero_rate_is_a_usage_error() {
    let sim = SimulatedClock::default();
    let err = FrameClock::with_source(0.0, &sim).unwrap_err();
    assert!(matches!(err, DisplayError::InvalidFrameRate(_)));
    assert_eq!(err.kind(), ErrorKind::Usage);
}
