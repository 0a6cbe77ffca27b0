//! Grid coordinates and the pin to coordinate map.
//!
//! A grid map is written as whitespace separated tokens in pin order. Spaces
//! and tabs both separate tokens:
//!
//! ```text
//! 0,0 1,0 2,0 - lasergate
//! ```
//!
//! `x,y` maps the pin to a cell, `lasergate` marks the laser gate pin and `-`
//! leaves the pin unmapped.

use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};

use crate::error::{FleetError, FleetResult};

/// Maximum number of pins tracked per device.
pub const MAX_PINS: usize = 100;

const LASER_GATE_TOKEN: &str = "lasergate";
const UNMAPPED_TOKEN: &str = "-";

/// What a pin means to the outside world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GridCoord {
    /// Unmapped. Never emitted as an event.
    #[default]
    Invalid,
    /// The laser gate pin.
    LaserGate,
    /// A grid cell.
    Cell { x: i32, y: i32 },
}

impl GridCoord {
    pub fn cell(x: i32, y: i32) -> Self {
        GridCoord::Cell { x, y }
    }

    /// Whether this coordinate can be emitted as an event.
    pub fn is_valid(&self) -> bool {
        !matches!(self, GridCoord::Invalid)
    }
}

impl fmt::Display for GridCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GridCoord::Invalid => f.write_str("invalid"),
            GridCoord::LaserGate => f.write_str(LASER_GATE_TOKEN),
            GridCoord::Cell { x, y } => write!(f, "{},{}", x, y),
        }
    }
}

impl Serialize for GridCoord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Parse one grid map token. Returns `None` if malformed.
fn parse_token(token: &str) -> Option<GridCoord> {
    if token.eq_ignore_ascii_case(LASER_GATE_TOKEN) {
        return Some(GridCoord::LaserGate);
    }
    if token == UNMAPPED_TOKEN {
        return Some(GridCoord::Invalid);
    }
    let (x, y) = token.split_once(',')?;
    Some(GridCoord::Cell {
        x: x.trim().parse().ok()?,
        y: y.trim().parse().ok()?,
    })
}

/// Pin index to grid coordinate mapping for one device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GridMap {
    entries: Vec<GridCoord>,
}

impl GridMap {
    /// Parse a whole map. Fails on the first malformed token, returning no map.
    pub fn parse(text: &str) -> FleetResult<GridMap> {
        let entries = text
            .split([' ', '\t'])
            .filter(|token| !token.is_empty())
            .enumerate()
            .map(|(index, token)| {
                parse_token(token).ok_or_else(|| FleetError::GridMapEntry {
                    index,
                    token: token.to_string(),
                })
            })
            .collect::<FleetResult<Vec<_>>>()?;

        if entries.len() > MAX_PINS {
            return Err(FleetError::GridMapTooLong {
                count: entries.len(),
                max: MAX_PINS,
            });
        }
        Ok(GridMap { entries })
    }

    /// Coordinate for a pin, `Invalid` outside the configured range.
    pub fn get(&self, pin: usize) -> GridCoord {
        self.entries.get(pin).copied().unwrap_or(GridCoord::Invalid)
    }

    /// Number of configured pins.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pin of the laser gate, if one is mapped.
    pub fn laser_gate_pin(&self) -> Option<usize> {
        self.entries.iter().position(|c| *c == GridCoord::LaserGate)
    }
}

impl FromStr for GridMap {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        GridMap::parse(s)
    }
}

impl fmt::Display for GridMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            match entry {
                GridCoord::Invalid => f.write_str(UNMAPPED_TOKEN)?,
                other => write!(f, "{}", other)?,
            }
        }
        Ok(())
    }
}
