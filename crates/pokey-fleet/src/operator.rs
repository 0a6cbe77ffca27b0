//! Operator commands and replies.
//!
//! Commands arrive as text lines (`setgridmap 22961 0,0 1,0`) and are parsed
//! into [`OperatorCommand`]. Replies render as text or JSON.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::device::DeviceSnapshot;
use crate::error::FleetError;
use crate::fleet::FleetStatus;
use crate::grid::GridCoord;

/// Usage lines for every command, in `help` order.
pub const COMMAND_USAGE: &[&str] = &[
    "setgridmap <serial> <map...>   map pins to x,y | lasergate | -",
    "devices                        list devices",
    "status                         connected count and stuck pins",
    "discovery [on|off]             toggle discovery broadcasts",
    "poll [on|off]                  toggle polling",
    "ignore <serial> [true|false]   ignore a device",
    "popgrid | peekgrid             last grid coordinate",
    "poplaser | peeklaser           last laser gate state",
    "fakediscover <count>           inject fake discovery replies",
    "initdevice <name> <address>    open a static channel",
    "help                           this list",
];

/// A parsed operator command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    SetGridMap { serial: u16, map: String },
    Devices,
    Status,
    /// `None` reports the current state.
    Discovery(Option<bool>),
    Poll(Option<bool>),
    Ignore { serial: u16, ignored: bool },
    PopGrid,
    PeekGrid,
    PopLaser,
    PeekLaser,
    FakeDiscover(usize),
    InitDevice { name: String, address: String },
    Help,
}

fn parse_serial(token: Option<&str>) -> Result<u16, FleetError> {
    let token = token.ok_or_else(|| FleetError::InvalidSerial(String::new()))?;
    token
        .parse()
        .map_err(|_| FleetError::InvalidSerial(token.to_string()))
}

fn parse_switch(token: Option<&str>) -> Result<Option<bool>, FleetError> {
    match token.map(|t| t.to_ascii_lowercase()).as_deref() {
        None => Ok(None),
        Some("on" | "true" | "1" | "enable") => Ok(Some(true)),
        Some("off" | "false" | "0" | "disable") => Ok(Some(false)),
        Some(other) => Err(FleetError::InvalidCommand(format!(
            "expected on or off, got '{}'",
            other
        ))),
    }
}

impl FromStr for OperatorCommand {
    type Err = FleetError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (name, rest) = line
            .split_once(char::is_whitespace)
            .map(|(name, rest)| (name, rest.trim()))
            .unwrap_or((line, ""));
        let mut args = rest.split_whitespace();

        match name.to_ascii_lowercase().as_str() {
            "setgridmap" => {
                let serial = parse_serial(args.next())?;
                // Everything after the serial is the map, tabs included.
                let map = rest
                    .split_once(char::is_whitespace)
                    .map(|(_, map)| map.trim().to_string())
                    .unwrap_or_default();
                if map.is_empty() {
                    return Err(FleetError::InvalidCommand("setgridmap needs a map".to_string()));
                }
                Ok(OperatorCommand::SetGridMap { serial, map })
            }
            "devices" => Ok(OperatorCommand::Devices),
            "status" => Ok(OperatorCommand::Status),
            "discovery" => Ok(OperatorCommand::Discovery(parse_switch(args.next())?)),
            "poll" => Ok(OperatorCommand::Poll(parse_switch(args.next())?)),
            "ignore" => {
                let serial = parse_serial(args.next())?;
                let ignored = parse_switch(args.next())?.unwrap_or(true);
                Ok(OperatorCommand::Ignore { serial, ignored })
            }
            "popgrid" => Ok(OperatorCommand::PopGrid),
            "peekgrid" => Ok(OperatorCommand::PeekGrid),
            "poplaser" => Ok(OperatorCommand::PopLaser),
            "peeklaser" => Ok(OperatorCommand::PeekLaser),
            "fakediscover" => {
                let count = args
                    .next()
                    .unwrap_or("1")
                    .parse()
                    .map_err(|_| FleetError::InvalidCommand("fakediscover needs a count".to_string()))?;
                Ok(OperatorCommand::FakeDiscover(count))
            }
            "initdevice" => match (args.next(), args.next()) {
                (Some(name), Some(address)) => Ok(OperatorCommand::InitDevice {
                    name: name.to_string(),
                    address: address.to_string(),
                }),
                _ => Err(FleetError::InvalidCommand(
                    "initdevice needs a name and an address".to_string(),
                )),
            },
            "help" | "?" => Ok(OperatorCommand::Help),
            "" => Err(FleetError::InvalidCommand("empty command".to_string())),
            other => Err(FleetError::InvalidCommand(format!("unknown command '{}'", other))),
        }
    }
}

/// Result of an operator command.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperatorReply {
    Ok { message: String },
    Devices { devices: Vec<DeviceSnapshot> },
    Status(FleetStatus),
    Toggle { feature: String, old: bool, new: bool },
    Coordinate { coordinate: GridCoord },
    LaserGate { state: bool },
    Help { commands: Vec<String> },
    Error { message: String },
}

impl OperatorReply {
    pub fn ok(message: impl Into<String>) -> Self {
        OperatorReply::Ok {
            message: message.into(),
        }
    }

    pub fn error(error: impl fmt::Display) -> Self {
        OperatorReply::Error {
            message: error.to_string(),
        }
    }

    pub fn help() -> Self {
        OperatorReply::Help {
            commands: COMMAND_USAGE.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, OperatorReply::Error { .. })
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl fmt::Display for OperatorReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatorReply::Ok { message } => f.write_str(message),
            OperatorReply::Devices { devices } => {
                if devices.is_empty() {
                    return f.write_str("no devices");
                }
                for (i, device) in devices.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}", device)?;
                }
                Ok(())
            }
            OperatorReply::Status(status) => {
                write!(
                    f,
                    "{}/{} connected",
                    status.connections.connected, status.connections.total
                )?;
                for report in &status.stuck {
                    for pin in &report.pins {
                        write!(
                            f,
                            "\npokey {} pin {} ({}) stuck for {:.1}s",
                            report.serial, pin.pin, pin.coordinate, pin.down_duration
                        )?;
                    }
                }
                Ok(())
            }
            OperatorReply::Toggle { feature, old, new } => {
                write!(f, "{} {} -> {}", feature, on_off(*old), on_off(*new))
            }
            OperatorReply::Coordinate { coordinate } => match coordinate {
                GridCoord::Invalid => f.write_str("-1"),
                other => write!(f, "{}", other),
            },
            OperatorReply::LaserGate { state } => write!(f, "{}", state),
            OperatorReply::Help { commands } => f.write_str(&commands.join("\n")),
            OperatorReply::Error { message } => write!(f, "error: {}", message),
        }
    }
}

fn on_off(state: bool) -> &'static str {
    if state {
        "on"
    } else {
        "off"
    }
}
