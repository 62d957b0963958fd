//! Authoritative simulation task.
//!
//! A single tick loop owns writes to the [`RoundController`]. HTTP handlers talk
//! to it through a command queue drained once per tick after the physics step
//! and phase transitions; readers take the lock only briefly or not at all.

use std::sync::Arc;
use std::time::Duration;

use marble_core::config::{GameConfig, MarbleConfig};
use marble_core::marble::{EntryError, EntryRequest, MarbleId, RosterEntry, ValidatedEntry};
use marble_core::physics::FixedStep;
use marble_core::protocol::Hello;
use marble_core::round::{RoundController, RoundEvent, RoundResults, RoundStatus};
use marble_core::snapshot::Snapshot;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::{COMMAND_CHANNEL_CAPACITY, EVENT_BROADCAST_CAPACITY};
use crate::service::replication::SnapshotSource;

#[derive(thiserror::Error, Debug)]
pub enum SimulationError {
    #[error(transparent)]
    Entry(#[from] EntryError),

    #[error("Simulation is not running")]
    Closed,
}

/// Mutation queued for the tick loop.
#[derive(Debug)]
pub enum Command {
    Enter {
        entry: ValidatedEntry,
        reply: oneshot::Sender<Result<MarbleId, EntryError>>,
    },
    Remove {
        id: MarbleId,
        reply: oneshot::Sender<bool>,
    },
    ForceStart {
        reply: oneshot::Sender<bool>,
    },
    ForceEnd {
        reply: oneshot::Sender<bool>,
    },
}

pub struct Simulation {
    controller: RwLock<RoundController>,
    // Latest encoded snapshot, keyed by its frame.
    cache: Mutex<Arc<Snapshot>>,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<RoundEvent>,
    marbles: MarbleConfig,
    step: Duration,
    max_catch_up: u32,
    steps: u32,
    tickrate: u32,
    started: Instant,
}

impl Simulation {
    /// Builds the simulation and the command receiver its tick loop drains.
    pub fn new(config: GameConfig) -> (Arc<Self>, mpsc::Receiver<Command>) {
        let (commands, receiver) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_BROADCAST_CAPACITY);

        let simulation = Self {
            marbles: config.marbles.clone(),
            step: config.physics.step_duration(),
            max_catch_up: config.physics.max_catch_up,
            steps: config.physics.steps,
            tickrate: config.replication.tickrate.max(1),
            controller: RwLock::new(RoundController::new(config)),
            cache: Mutex::new(Arc::new(Snapshot::empty())),
            commands,
            events,
            started: Instant::now(),
        };
        (Arc::new(simulation), receiver)
    }

    /// Monotonic server clock.
    pub fn now(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn tickrate(&self) -> u32 {
        self.tickrate
    }

    pub fn hello(&self) -> Hello {
        Hello::new(self.tickrate, self.steps)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoundEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> RoundStatus {
        self.controller.read().status(self.now())
    }

    pub fn roster(&self) -> Vec<RosterEntry> {
        self.controller.read().roster()
    }

    pub fn last_results(&self) -> Option<RoundResults> {
        self.controller.read().last_results().cloned()
    }

    pub fn frame(&self) -> u64 {
        self.controller.read().frame()
    }

    /// Current frame and the physics state hash taken at that frame.
    pub fn world_hash(&self) -> (u64, u64) {
        let controller = self.controller.read();
        (controller.frame(), controller.world().compute_hash())
    }

    /// Validates an entry and queues it for the next tick.
    pub async fn enter(&self, request: EntryRequest) -> Result<MarbleId, SimulationError> {
        let entry = request.validate(&self.marbles)?;
        let id = self
            .request(|reply| Command::Enter { entry, reply })
            .await??;
        Ok(id)
    }

    pub async fn remove(&self, id: MarbleId) -> Result<bool, SimulationError> {
        self.request(|reply| Command::Remove { id, reply }).await
    }

    pub async fn force_start(&self) -> Result<bool, SimulationError> {
        self.request(|reply| Command::ForceStart { reply }).await
    }

    pub async fn force_end(&self) -> Result<bool, SimulationError> {
        self.request(|reply| Command::ForceEnd { reply }).await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SimulationError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| SimulationError::Closed)?;
        response.await.map_err(|_| SimulationError::Closed)
    }

    /// Runs the fixed-rate tick loop forever.
    pub async fn run_tick_loop(self: Arc<Self>, mut commands: mpsc::Receiver<Command>) {
        let mut clock = FixedStep::new(self.step, self.max_catch_up);
        let mut interval = tokio::time::interval(self.step);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last = Instant::now();

        info!(steps = self.steps, tickrate = self.tickrate, "simulation started");
        loop {
            interval.tick().await;
            let now = Instant::now();
            let ticks = clock.advance(now - last);
            last = now;

            for _ in 0..ticks {
                self.tick_once(&mut commands);
            }
        }
    }

    /// One physics tick followed by every queued command.
    pub(crate) fn tick_once(&self, commands: &mut mpsc::Receiver<Command>) {
        let now = self.now();
        let events = {
            let mut controller = self.controller.write();
            let mut events = controller.tick(now);
            while let Ok(command) = commands.try_recv() {
                apply(&mut controller, command, now);
            }
            events.extend(controller.take_events());
            events
        };

        for event in events {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }
}

fn apply(controller: &mut RoundController, command: Command, now: Duration) {
    // A dropped reply means the caller went away; the command still applies.
    match command {
        Command::Enter { entry, reply } => {
            let result = controller.enter(entry, now);
            if let Err(err) = &result {
                debug!(error = %err, "entry rejected");
            }
            let _ = reply.send(result);
        }
        Command::Remove { id, reply } => {
            let _ = reply.send(controller.remove(id));
        }
        Command::ForceStart { reply } => {
            let _ = reply.send(controller.force_start(now));
        }
        Command::ForceEnd { reply } => {
            let _ = reply.send(controller.force_end(now));
        }
    }
}

impl SnapshotSource for Simulation {
    /// Never waits for the tick: while the tick holds the write lock the
    /// previously committed snapshot is served.
    fn latest(&self) -> Arc<Snapshot> {
        let Some(controller) = self.controller.try_read() else {
            return self.cache.lock().clone();
        };

        let mut cache = self.cache.lock();
        if cache.frame() != controller.frame() {
            *cache = Arc::new(controller.encode());
        }
        cache.clone()
    }
}
