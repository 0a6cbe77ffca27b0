//! Running fleet: schedulers, reply dispatcher and operator commands.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{select, Receiver, Sender};
use tracing::{debug, info};

use crate::error::FleetResult;
use crate::fleet::Fleet;
use crate::operator::{OperatorCommand, OperatorReply};
use crate::scheduler::PeriodicTask;
use crate::transport::InboundReply;

/// A started fleet.
pub struct FleetService {
    fleet: Arc<Fleet>,
    discovery: PeriodicTask,
    poll: PeriodicTask,
    dispatcher: Option<JoinHandle<()>>,
    dispatcher_stop: Sender<()>,
}

impl FleetService {
    /// Start the reply dispatcher and both schedulers.
    pub fn start(fleet: Arc<Fleet>, inbound: Receiver<InboundReply>) -> FleetResult<Self> {
        let (dispatcher_stop, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let dispatch_fleet = Arc::clone(&fleet);
        let dispatcher = thread::Builder::new()
            .name("pokey-dispatch".to_string())
            .spawn(move || loop {
                let reply = select! {
                    recv(inbound) -> reply => reply.ok(),
                    recv(stop_rx) -> _ => None,
                };
                match reply {
                    Some(reply) => dispatch_fleet.on_reply(reply),
                    None => break,
                }
            })?;

        let config = fleet.config().clone();
        let discovery_fleet = Arc::clone(&fleet);
        let discovery = PeriodicTask::spawn(
            "pokey-discovery",
            config.discovery_interval(),
            config.discovery_enabled,
            move || discovery_fleet.discovery_cycle(),
        )?;

        let poll_fleet = Arc::clone(&fleet);
        let poll = PeriodicTask::spawn(
            "pokey-poll",
            config.poll_interval(),
            config.poll_enabled,
            move || {
                poll_fleet.poll_cycle();
            },
        )?;

        info!(
            discovery = config.discovery_enabled,
            poll = config.poll_enabled,
            "fleet service started"
        );
        Ok(FleetService {
            fleet,
            discovery,
            poll,
            dispatcher: Some(dispatcher),
            dispatcher_stop,
        })
    }

    pub fn fleet(&self) -> &Arc<Fleet> {
        &self.fleet
    }

    pub fn discovery(&self) -> &PeriodicTask {
        &self.discovery
    }

    pub fn poll(&self) -> &PeriodicTask {
        &self.poll
    }

    /// Run one operator command.
    pub fn execute(&self, command: OperatorCommand) -> OperatorReply {
        debug!(?command, "operator command");
        let fleet = &self.fleet;
        match command {
            OperatorCommand::SetGridMap { serial, map } => match fleet.set_grid_map(serial, &map) {
                Ok(count) => OperatorReply::ok(format!("pokey {} grid map set ({} pins)", serial, count)),
                Err(e) => OperatorReply::error(e),
            },
            OperatorCommand::Devices => OperatorReply::Devices {
                devices: fleet.device_snapshots(),
            },
            OperatorCommand::Status => OperatorReply::Status(fleet.status()),
            OperatorCommand::Discovery(state) => toggle("discovery", &self.discovery, state),
            OperatorCommand::Poll(state) => toggle("poll", &self.poll, state),
            OperatorCommand::Ignore { serial, ignored } => {
                let old = fleet.set_ignored(serial, ignored);
                OperatorReply::Toggle {
                    feature: format!("ignore {}", serial),
                    old,
                    new: ignored,
                }
            }
            OperatorCommand::PopGrid => OperatorReply::Coordinate {
                coordinate: fleet.latch().pop_coordinate(),
            },
            OperatorCommand::PeekGrid => OperatorReply::Coordinate {
                coordinate: fleet.latch().peek_coordinate(),
            },
            OperatorCommand::PopLaser => OperatorReply::LaserGate {
                state: fleet.latch().pop_laser_gate(),
            },
            OperatorCommand::PeekLaser => OperatorReply::LaserGate {
                state: fleet.latch().peek_laser_gate(),
            },
            OperatorCommand::FakeDiscover(count) => {
                let accepted = fleet.inject_fake_discoveries(count, &mut rand::thread_rng());
                OperatorReply::ok(format!("injected {} fake discoveries", accepted))
            }
            OperatorCommand::InitDevice { name, address } => match fleet.init_device(&name, &address) {
                Ok(connection) => OperatorReply::ok(format!("added channel {} to {}", connection, address)),
                Err(e) => OperatorReply::error(e),
            },
            OperatorCommand::Help => OperatorReply::help(),
        }
    }

    /// Stop both schedulers, join them, then stop the dispatcher.
    pub fn shutdown(mut self) {
        self.discovery.signal_stop();
        self.poll.signal_stop();
        self.discovery.join();
        self.poll.join();

        let _ = self.dispatcher_stop.try_send(());
        if let Some(handle) = self.dispatcher.take() {
            let _ = handle.join();
        }
        info!("fleet service stopped");
    }
}

fn toggle(feature: &str, task: &PeriodicTask, state: Option<bool>) -> OperatorReply {
    let old = match state {
        Some(new) => task.set_enabled(new),
        None => task.is_enabled(),
    };
    let new = state.unwrap_or(old);
    info!(feature, old, new, "toggled");
    OperatorReply::Toggle {
        feature: feature.to_string(),
        old,
        new,
    }
}
