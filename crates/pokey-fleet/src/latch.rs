//! Single-slot holders for the most recent grid and laser gate events.
//!
//! Every device's poll handler writes here and operators read from here.
//! Pop reads and clears. Peek reads without clearing but treats anything
//! older than the expiry as empty.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::grid::GridCoord;

#[derive(Debug, Clone, Copy)]
struct Slot<T> {
    value: T,
    updated: Option<Instant>,
}

impl<T: Copy + Default> Slot<T> {
    fn empty() -> Self {
        Slot {
            value: T::default(),
            updated: None,
        }
    }

    fn store(&mut self, value: T, now: Instant) {
        self.value = value;
        self.updated = Some(now);
    }

    fn pop(&mut self) -> T {
        std::mem::replace(self, Slot::empty()).value
    }

    fn peek(&self, now: Instant, expiry: Duration) -> T {
        match self.updated {
            Some(at) if now.saturating_duration_since(at) <= expiry => self.value,
            _ => T::default(),
        }
    }
}

/// Latest grid coordinate and laser gate state.
#[derive(Debug)]
pub struct EventLatch {
    coordinate: Mutex<Slot<GridCoord>>,
    laser_gate: Mutex<Slot<bool>>,
    expiry: Duration,
}

impl EventLatch {
    pub fn new(expiry: Duration) -> Self {
        EventLatch {
            coordinate: Mutex::new(Slot::empty()),
            laser_gate: Mutex::new(Slot::empty()),
            expiry,
        }
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    /// Publish a coordinate. The laser gate sentinel sets the laser gate
    /// state instead.
    pub fn push_coordinate(&self, coordinate: GridCoord) {
        self.push_coordinate_at(coordinate, Instant::now());
    }

    pub fn push_coordinate_at(&self, coordinate: GridCoord, now: Instant) {
        if coordinate == GridCoord::LaserGate {
            self.push_laser_gate_at(true, now);
            return;
        }
        self.coordinate.lock().store(coordinate, now);
    }

    pub fn push_laser_gate(&self, state: bool) {
        self.push_laser_gate_at(state, Instant::now());
    }

    pub fn push_laser_gate_at(&self, state: bool, now: Instant) {
        self.laser_gate.lock().store(state, now);
    }

    /// Take the coordinate, leaving `Invalid`.
    pub fn pop_coordinate(&self) -> GridCoord {
        self.coordinate.lock().pop()
    }

    pub fn peek_coordinate(&self) -> GridCoord {
        self.peek_coordinate_at(Instant::now())
    }

    pub fn peek_coordinate_at(&self, now: Instant) -> GridCoord {
        self.coordinate.lock().peek(now, self.expiry)
    }

    /// Take the laser gate state, leaving `false`.
    pub fn pop_laser_gate(&self) -> bool {
        self.laser_gate.lock().pop()
    }

    pub fn peek_laser_gate(&self) -> bool {
        self.peek_laser_gate_at(Instant::now())
    }

    pub fn peek_laser_gate_at(&self, now: Instant) -> bool {
        self.laser_gate.lock().peek(now, self.expiry)
    }
}

impl Default for EventLatch {
    fn default() -> Self {
        EventLatch::new(Duration::from_millis(1000))
    }
}
