//! Per-device pin state and stuck pin filtering.
//!
//! Each poll reply carries the level of every pin. [`PinEngine::update_pins`]
//! turns that snapshot into at most one event: the coordinate of the last pin
//! in index order that is down, mapped, and not stuck. A pin is stuck once it
//! has been down for `stuck_threshold` seconds of accumulated poll time; it
//! re-arms the first time it reads up.

use std::time::Instant;

use pokey_protocol::PinMask;
use serde::Serialize;

use crate::grid::{GridCoord, GridMap, MAX_PINS};

/// State of one physical pin.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PinState {
    /// Coordinate from the grid map.
    pub coordinate: GridCoord,
    /// Seconds the pin has read down without interruption.
    pub down_duration: f64,
}

/// A pin currently filtered out as stuck.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StuckPin {
    pub pin: usize,
    pub coordinate: GridCoord,
    pub down_duration: f64,
}

/// Pin states and grid map for one device.
#[derive(Debug, Clone)]
pub struct PinEngine {
    pins: Vec<PinState>,
    grid_map: GridMap,
    stuck_threshold: f64,
    last_update: Option<Instant>,
}

impl PinEngine {
    pub fn new(stuck_threshold: f64) -> Self {
        PinEngine {
            pins: Vec::new(),
            grid_map: GridMap::default(),
            stuck_threshold,
            last_update: None,
        }
    }

    /// Replace the grid map. Down durations are kept.
    pub fn set_grid_map(&mut self, map: GridMap) {
        self.grid_map = map;
        self.grow(self.grid_map.len());
        for (i, pin) in self.pins.iter_mut().enumerate() {
            pin.coordinate = self.grid_map.get(i);
        }
    }

    pub fn grid_map(&self) -> &GridMap {
        &self.grid_map
    }

    pub fn pins(&self) -> &[PinState] {
        &self.pins
    }

    pub fn stuck_threshold(&self) -> f64 {
        self.stuck_threshold
    }

    fn grow(&mut self, count: usize) {
        let count = count.min(MAX_PINS);
        while self.pins.len() < count {
            let coordinate = self.grid_map.get(self.pins.len());
            self.pins.push(PinState {
                coordinate,
                down_duration: 0.0,
            });
        }
    }

    /// Apply one poll snapshot taken at `now`. Returns the coordinate to
    /// publish, or `Invalid` if no pin qualified.
    pub fn update_pins(&mut self, mask: &PinMask, now: Instant) -> GridCoord {
        let delta = match self.last_update {
            Some(previous) => now
                .saturating_duration_since(previous)
                .as_secs_f64()
                .clamp(0.0, 1.0),
            None => 0.0,
        };
        self.last_update = Some(now);
        self.grow(mask.len());

        let mut result = GridCoord::Invalid;
        for (pin, down) in self.pins.iter_mut().zip(mask.iter()) {
            if !down {
                pin.down_duration = 0.0;
                continue;
            }
            pin.down_duration += delta;
            if pin.down_duration < self.stuck_threshold && pin.coordinate.is_valid() {
                result = pin.coordinate;
            }
        }
        result
    }

    /// Pins currently down for at least the stuck threshold.
    pub fn stuck_pins(&self) -> Vec<StuckPin> {
        self.pins
            .iter()
            .enumerate()
            .filter(|(_, pin)| pin.down_duration >= self.stuck_threshold)
            .map(|(i, pin)| StuckPin {
                pin: i,
                coordinate: pin.coordinate,
                down_duration: pin.down_duration,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn engine(map: &str) -> PinEngine {
        let mut engine = PinEngine::new(2.0);
        engine.set_grid_map(GridMap::parse(map).unwrap());
        engine
    }

    #[test]
    fn test_mapped_pin_emits() {
        let mut engine = engine("- - - 2,1");
        let now = Instant::now();
        assert_eq!(engine.update_pins(&PinMask::with_down(&[3]), now), GridCoord::cell(2, 1));
        assert_eq!(engine.update_pins(&PinMask::empty(), now), GridCoord::Invalid);
    }

    #[test]
    fn test_unmapped_pin_accumulates_without_emitting() {
        let mut engine = engine("0,0");
        let start = Instant::now();
        let mask = PinMask::with_down(&[10]);
        assert_eq!(engine.update_pins(&mask, start), GridCoord::Invalid);
        assert_eq!(engine.update_pins(&mask, start + Duration::from_millis(500)), GridCoord::Invalid);
        assert!((engine.pins()[10].down_duration - 0.5).abs() < 1e-9);
        assert_eq!(engine.pins().len(), pokey_protocol::PIN_COUNT);
    }

    #[test]
    fn test_last_pin_wins() {
        let mut engine = engine("0,0 1,0 2,0");
        let coord = engine.update_pins(&PinMask::with_down(&[0, 2]), Instant::now());
        assert_eq!(coord, GridCoord::cell(2, 0));
    }

    #[test]
    fn test_first_update_has_zero_delta() {
        let mut engine = engine("0,0");
        engine.update_pins(&PinMask::with_down(&[0]), Instant::now());
        assert_eq!(engine.pins()[0].down_duration, 0.0);
    }

    #[test]
    fn test_delta_is_clamped() {
        let mut engine = engine("0,0");
        let start = Instant::now();
        let mask = PinMask::with_down(&[0]);
        engine.update_pins(&mask, start);
        engine.update_pins(&mask, start + Duration::from_secs(30));
        assert_eq!(engine.pins()[0].down_duration, 1.0);
    }

    #[test]
    fn test_stuck_pin_filtered_until_release() {
        let mut engine = engine("5,5");
        let start = Instant::now();
        let down = PinMask::with_down(&[0]);

        assert_eq!(engine.update_pins(&down, start), GridCoord::cell(5, 5));
        assert_eq!(engine.update_pins(&down, start + Duration::from_secs(1)), GridCoord::cell(5, 5));
        // 2.0s accumulated: stuck.
        assert_eq!(engine.update_pins(&down, start + Duration::from_secs(2)), GridCoord::Invalid);
        assert_eq!(engine.stuck_pins().len(), 1);
        assert_eq!(engine.stuck_pins()[0].coordinate, GridCoord::cell(5, 5));

        assert_eq!(engine.update_pins(&PinMask::empty(), start + Duration::from_secs(3)), GridCoord::Invalid);
        assert!(engine.stuck_pins().is_empty());
        assert_eq!(engine.update_pins(&down, start + Duration::from_secs(4)), GridCoord::cell(5, 5));
    }

    #[test]
    fn test_regrid_keeps_durations() {
        let mut engine = engine("0,0");
        let start = Instant::now();
        let down = PinMask::with_down(&[0]);
        engine.update_pins(&down, start);
        engine.update_pins(&down, start + Duration::from_millis(700));

        engine.set_grid_map(GridMap::parse("9,9").unwrap());
        assert_eq!(engine.pins()[0].coordinate, GridCoord::cell(9, 9));
        assert!((engine.pins()[0].down_duration - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_grid_map_grows_pins_to_cap() {
        let text = vec!["1,1"; MAX_PINS].join(" ");
        let engine = engine(&text);
        assert_eq!(engine.pins().len(), MAX_PINS);
    }
}
