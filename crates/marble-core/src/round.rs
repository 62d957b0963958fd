//! Round state machine: entry period, race, finish/cooldown.
//!
//! The controller owns the entity table and the physics world. It is driven by a
//! single writer calling [`RoundController::tick`] once per physics tick, with the
//! server clock passed in as a `Duration` since process start. Within a tick the
//! order is fixed: physics step, finish detection, phase transitions. Queued
//! entries and removals are applied by the caller after `tick` returns.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::GameConfig;
use crate::marble::{
    Color, EntityTable, EntryError, MarbleEntity, MarbleId, RosterEntry, ValidatedEntry,
    mass_for_radius,
};
use crate::physics::PhysicsWorld;
use crate::snapshot::{Snapshot, SnapshotEncoder};

/// Serializes a `Duration` as fractional seconds.
pub(crate) mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase {
    Entering,
    Racing,
    Finished,
}

impl fmt::Display for RoundPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Entering => "entering",
            Self::Racing => "racing",
            Self::Finished => "finished",
        };
        f.write_str(name)
    }
}

/// A marble crossing the finish threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FinishEvent {
    pub entity_id: MarbleId,
    /// Server clock at detection.
    #[serde(with = "secs")]
    pub finish_time: Duration,
    /// Time since the race started.
    #[serde(with = "secs")]
    pub race_time: Duration,
}

#[derive(Debug, Clone)]
pub struct RoundState {
    pub phase: RoundPhase,
    pub round: u64,
    /// First accepted entry of the round; starts the entry timer.
    pub entered_at: Option<Duration>,
    pub started_at: Option<Duration>,
    pub finished_at: Option<Duration>,
    /// Deadline of the current phase, if its timer is running.
    pub ends_no_later_than: Option<Duration>,
    pub finish_order: Vec<FinishEvent>,
    pub aborted: bool,
}

impl RoundState {
    fn new(round: u64) -> Self {
        Self {
            phase: RoundPhase::Entering,
            round,
            entered_at: None,
            started_at: None,
            finished_at: None,
            ends_no_later_than: None,
            finish_order: Vec::new(),
            aborted: false,
        }
    }
}

/// Final standings of a round, handed to statistics/leaderboard collaborators.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoundResults {
    pub round: u64,
    pub aborted: bool,
    pub finish_order: Vec<FinishEvent>,
    /// Every marble alive when the round finished, in entry order.
    pub participants: Vec<RosterEntry>,
    pub recorded_at: DateTime<Utc>,
}

impl RoundResults {
    pub fn placing(&self, id: MarbleId) -> Option<usize> {
        self.finish_order
            .iter()
            .position(|event| event.entity_id == id)
            .map(|index| index + 1)
    }
}

/// Phase and timer view for UI display.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoundStatus {
    pub round: u64,
    pub phase: RoundPhase,
    pub time_remaining_ms: Option<u64>,
    pub live: usize,
    pub finished: usize,
    pub server_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoundEvent {
    PhaseChanged { round: u64, phase: RoundPhase },
    MarbleEntered { round: u64, id: MarbleId },
    MarbleRemoved { round: u64, id: MarbleId },
    MarbleFinished { round: u64, event: FinishEvent },
    Finished(RoundResults),
    /// Entities destroyed; `round` is the new round number.
    Reset { round: u64 },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RoundError {
    #[error("Marble {0} has no physics body")]
    MissingBody(MarbleId),

    #[error("{bodies} dynamic bodies registered for {marbles} marbles")]
    BodyCountMismatch { bodies: usize, marbles: usize },
}

pub struct RoundController {
    config: GameConfig,
    state: RoundState,
    table: EntityTable,
    world: PhysicsWorld,
    rng: ChaCha8Rng,
    now: Duration,
    last_results: Option<RoundResults>,
    events: Vec<RoundEvent>,
}

impl fmt::Debug for RoundController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoundController")
            .field("state", &self.state)
            .field("live", &self.table.len())
            .field("world", &self.world)
            .finish_non_exhaustive()
    }
}

fn deadline(from: Duration, length: Duration) -> Duration {
    from.checked_add(length).unwrap_or(Duration::MAX)
}

impl RoundController {
    pub fn new(config: GameConfig) -> Self {
        let world = PhysicsWorld::new(&config.physics, &config.track);
        let rng = match config.physics.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed.wrapping_add(1)),
            None => ChaCha8Rng::from_rng(&mut rand::rng()),
        };
        Self {
            config,
            state: RoundState::new(1),
            table: EntityTable::new(),
            world,
            rng,
            now: Duration::ZERO,
            last_results: None,
            events: Vec::new(),
        }
    }

    pub fn config(&self) -> &GameConfig {
        &self.config
    }

    pub fn state(&self) -> &RoundState {
        &self.state
    }

    pub fn phase(&self) -> RoundPhase {
        self.state.phase
    }

    pub fn table(&self) -> &EntityTable {
        &self.table
    }

    pub fn world(&self) -> &PhysicsWorld {
        &self.world
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn frame(&self) -> u64 {
        self.world.current_frame()
    }

    /// Results of the most recently finished round.
    pub fn last_results(&self) -> Option<&RoundResults> {
        self.last_results.as_ref()
    }

    pub fn roster(&self) -> Vec<RosterEntry> {
        self.table.roster()
    }

    /// Takes the events produced since the last call.
    pub fn take_events(&mut self) -> Vec<RoundEvent> {
        std::mem::take(&mut self.events)
    }

    /// Phase and timer view as of `now` (never earlier than the last tick).
    pub fn status(&self, now: Duration) -> RoundStatus {
        let now = self.now.max(now);
        let time_remaining_ms = self
            .state
            .ends_no_later_than
            .map(|deadline| deadline.saturating_sub(now).as_millis())
            .map(|ms| u64::try_from(ms).unwrap_or(u64::MAX));
        RoundStatus {
            round: self.state.round,
            phase: self.state.phase,
            time_remaining_ms,
            live: self.table.len(),
            finished: self.table.finished_count(),
            server_time_ms: u64::try_from(now.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Encodes the committed transforms of all live marbles.
    pub fn encode(&self) -> Snapshot {
        SnapshotEncoder::encode(&self.table, &self.world, self.frame(), self.now)
    }

    /// Advances one physics tick, then detects finishes and applies timed
    /// transitions. Returns every event produced since the previous tick.
    pub fn tick(&mut self, now: Duration) -> Vec<RoundEvent> {
        self.advance_clock(now);
        self.world.step();

        if let Err(err) = self.check_invariants() {
            error!(round = self.state.round, error = %err, "round invariant violated; aborting round");
            self.abort();
        } else {
            if self.state.phase == RoundPhase::Racing {
                self.detect_finishes();
            }
            self.apply_transitions();
        }
        self.take_events()
    }

    fn advance_clock(&mut self, now: Duration) {
        self.now = self.now.max(now);
    }

    /// Adds a marble for a validated entry. Only accepted while entering.
    pub fn enter(&mut self, entry: ValidatedEntry, now: Duration) -> Result<MarbleId, EntryError> {
        self.advance_clock(now);
        if self.state.phase != RoundPhase::Entering {
            return Err(EntryError::NotAccepting(self.state.phase));
        }
        if let Some(owner) = entry.owner_id.as_deref() {
            let limit = self.config.marbles.max_per_owner;
            if self.table.owned_by(owner) >= limit {
                return Err(EntryError::OwnerLimit(limit));
            }
        }

        let marbles = &self.config.marbles;
        let size = self.rng.random_range(marbles.min_radius..=marbles.max_radius);
        let density = marbles.density;
        let color = entry
            .color
            .unwrap_or_else(|| Color::PALETTE[self.rng.random_range(0..Color::PALETTE.len())]);

        let world = &mut self.world;
        let id = self.table.insert_with(|id| MarbleEntity {
            id,
            owner_id: entry.owner_id,
            display_name: entry.display_name,
            color,
            size,
            mass: mass_for_radius(size, density),
            body: world.spawn_body(size, density, u128::from(id)),
            finished: false,
            finish_time: None,
        });

        if self.state.entered_at.is_none() {
            self.state.entered_at = Some(self.now);
            self.state.ends_no_later_than =
                Some(deadline(self.now, self.config.round.enter_period()));
        }

        info!(round = self.state.round, marble_id = id, live = self.table.len(), "marble entered");
        self.events.push(RoundEvent::MarbleEntered {
            round: self.state.round,
            id,
        });
        Ok(id)
    }

    /// Removes a marble and its body (moderation). Returns false for unknown ids.
    pub fn remove(&mut self, id: MarbleId) -> bool {
        let Some(marble) = self.table.remove(id) else {
            return false;
        };
        self.world.remove_body(marble.body);
        info!(round = self.state.round, marble_id = id, "marble removed");
        self.events.push(RoundEvent::MarbleRemoved {
            round: self.state.round,
            id,
        });
        true
    }

    /// Starts the race immediately. Only valid while entering.
    pub fn force_start(&mut self, now: Duration) -> bool {
        self.advance_clock(now);
        if self.state.phase != RoundPhase::Entering {
            return false;
        }
        info!(round = self.state.round, "race force-started");
        self.begin_race();
        true
    }

    /// Ends the round immediately from any phase other than `Finished`.
    pub fn force_end(&mut self, now: Duration) -> bool {
        self.advance_clock(now);
        if self.state.phase == RoundPhase::Finished {
            return false;
        }
        info!(round = self.state.round, phase = %self.state.phase, "round force-ended");
        self.finish();
        true
    }

    fn check_invariants(&self) -> Result<(), RoundError> {
        for marble in self.table.iter() {
            if !self.world.contains(marble.body) {
                return Err(RoundError::MissingBody(marble.id));
            }
        }
        let bodies = self.world.dynamic_body_count();
        if bodies != self.table.len() {
            return Err(RoundError::BodyCountMismatch {
                bodies,
                marbles: self.table.len(),
            });
        }
        Ok(())
    }

    fn detect_finishes(&mut self) {
        let started_at = self.state.started_at.unwrap_or(self.now);
        let mut last = self.state.finish_order.last().map(|e| e.finish_time);

        for marble in self.table.iter_mut() {
            if marble.finished || !self.world.below_finish_line(marble.body) {
                continue;
            }

            // Same-tick finishes keep detection order and stay strictly increasing.
            let finish_time = match last {
                Some(previous) if self.now <= previous => previous + Duration::from_micros(1),
                _ => self.now,
            };
            last = Some(finish_time);

            marble.finished = true;
            marble.finish_time = Some(finish_time);
            let event = FinishEvent {
                entity_id: marble.id,
                finish_time,
                race_time: finish_time.saturating_sub(started_at),
            };
            self.state.finish_order.push(event);

            info!(
                round = self.state.round,
                marble_id = marble.id,
                place = self.state.finish_order.len(),
                race_ms = event.race_time.as_millis(),
                "marble finished"
            );
            self.events.push(RoundEvent::MarbleFinished {
                round: self.state.round,
                event,
            });
        }
    }

    fn apply_transitions(&mut self) {
        let deadline_passed = self
            .state
            .ends_no_later_than
            .is_some_and(|deadline| self.now >= deadline);

        match self.state.phase {
            RoundPhase::Entering => {
                if deadline_passed {
                    self.begin_race();
                }
            }
            RoundPhase::Racing => {
                if self.table.finished_count() == self.table.len() {
                    self.finish();
                } else if deadline_passed {
                    debug!(
                        round = self.state.round,
                        unfinished = self.table.len() - self.table.finished_count(),
                        "round length exceeded"
                    );
                    self.finish();
                }
            }
            RoundPhase::Finished => {
                if deadline_passed {
                    self.reset();
                }
            }
        }
    }

    fn set_phase(&mut self, phase: RoundPhase) {
        self.state.phase = phase;
        self.events.push(RoundEvent::PhaseChanged {
            round: self.state.round,
            phase,
        });
    }

    fn begin_race(&mut self) {
        self.state.started_at = Some(self.now);
        self.state.ends_no_later_than =
            Some(deadline(self.now, self.config.round.max_round_length()));
        self.world.open_gates();
        self.set_phase(RoundPhase::Racing);
        info!(round = self.state.round, live = self.table.len(), "race started");

        if self.table.is_empty() {
            info!(round = self.state.round, "race started with no marbles");
            self.finish();
        }
    }

    fn finish(&mut self) {
        self.state.finished_at = Some(self.now);
        self.state.ends_no_later_than =
            Some(deadline(self.now, self.config.round.wait_after_finish()));
        self.set_phase(RoundPhase::Finished);

        let results = RoundResults {
            round: self.state.round,
            aborted: self.state.aborted,
            finish_order: self.state.finish_order.clone(),
            participants: self.table.roster(),
            recorded_at: Utc::now(),
        };
        info!(
            round = results.round,
            finished = results.finish_order.len(),
            participants = results.participants.len(),
            aborted = results.aborted,
            "round finished"
        );
        self.last_results = Some(results.clone());
        self.events.push(RoundEvent::Finished(results));
    }

    fn reset(&mut self) {
        for marble in self.table.clear() {
            self.world.remove_body(marble.body);
        }
        let orphans = self.world.reset();
        if orphans > 0 {
            warn!(round = self.state.round, orphans, "removed orphaned bodies on reset");
        }

        self.state = RoundState::new(self.state.round + 1);
        self.events.push(RoundEvent::Reset {
            round: self.state.round,
        });
        info!(round = self.state.round, "round reset; entries open");
    }

    fn abort(&mut self) {
        self.state.aborted = true;
        if self.state.phase != RoundPhase::Finished {
            self.finish();
        }
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marble::EntryRequest;

    const STEPS: u32 = 100;

    fn test_config() -> GameConfig {
        let mut config = GameConfig::default();
        config.physics.gravity = [0.0, 0.0, 0.0];
        config.physics.steps = STEPS;
        config.physics.seed = Some(7);
        config.track.colliders.clear();
        config.marbles.max_per_owner = 2;
        config
    }

    fn at(tick: u64) -> Duration {
        Duration::from_millis(tick * 1000 / u64::from(STEPS))
    }

    fn ticks(s: u64) -> u64 {
        s * u64::from(STEPS)
    }

    /// Ticks from `from` up to and including `to`.
    fn run(controller: &mut RoundController, from: u64, to: u64) {
        for tick in from..=to {
            controller.tick(at(tick));
        }
    }

    fn entry(owner: &str) -> ValidatedEntry {
        EntryRequest {
            owner_id: Some(owner.to_string()),
            display_name: owner.to_uppercase(),
            color: None,
        }
        .validate(&test_config().marbles)
        .unwrap()
    }

    fn drop_below_finish(controller: &mut RoundController, id: MarbleId) {
        let body = controller.table.get(id).unwrap().body;
        let y = controller.world.finish_threshold() - 1.0;
        #[allow(clippy::cast_precision_loss)]
        let x = id as f32 * 2.0;
        assert!(controller.world.teleport(body, [x, y, 0.0]));
    }

    #[test]
    fn test_starts_entering_without_timer() {
        let mut controller = RoundController::new(test_config());
        run(&mut controller, 0, ticks(100));

        assert_eq!(controller.phase(), RoundPhase::Entering);
        assert_eq!(controller.status(controller.now()).time_remaining_ms, None);
        assert_eq!(controller.state().round, 1);
    }

    #[test]
    fn test_enter_period_scenario() {
        let mut controller = RoundController::new(test_config());

        controller.tick(at(0));
        controller.enter(entry("a"), controller.now()).unwrap();
        run(&mut controller, 1, ticks(5));
        controller.enter(entry("b"), controller.now()).unwrap();
        run(&mut controller, ticks(5) + 1, ticks(10));
        controller.enter(entry("c"), controller.now()).unwrap();
        run(&mut controller, ticks(10) + 1, ticks(39));
        assert_eq!(controller.phase(), RoundPhase::Entering);

        run(&mut controller, ticks(39) + 1, ticks(41));
        assert_eq!(controller.phase(), RoundPhase::Racing);
        assert_eq!(controller.table().len(), 3);
        assert!(controller.state().finish_order.is_empty());
        assert_eq!(controller.state().started_at, Some(at(ticks(40))));
    }

    #[test]
    fn test_every_accepted_entry_is_live() {
        let mut controller = RoundController::new(test_config());
        controller.tick(at(0));

        let mut accepted = 0;
        for i in 0..12 {
            let owner = format!("owner{}", i % 5);
            if controller.enter(entry(&owner), controller.now()).is_ok() {
                accepted += 1;
            }
        }
        // Five owners, two marbles each.
        assert_eq!(accepted, 10);
        assert_eq!(controller.table().len(), accepted);
        assert_eq!(controller.world().dynamic_body_count(), accepted);
    }

    #[test]
    fn test_entry_rejected_while_racing() {
        let mut controller = RoundController::new(test_config());
        controller.tick(at(0));
        controller.enter(entry("a"), controller.now()).unwrap();
        assert!(controller.force_start(controller.now()));

        let err = controller.enter(entry("b"), controller.now()).unwrap_err();
        assert_eq!(err, EntryError::NotAccepting(RoundPhase::Racing));
        assert_eq!(controller.table().len(), 1);
    }

    #[test]
    fn test_owner_limit() {
        let mut controller = RoundController::new(test_config());
        controller.tick(at(0));
        controller.enter(entry("a"), controller.now()).unwrap();
        controller.enter(entry("a"), controller.now()).unwrap();

        assert_eq!(controller.enter(entry("a"), controller.now()), Err(EntryError::OwnerLimit(2)));
        assert_eq!(controller.table().len(), 2);
    }

    #[test]
    fn test_zero_marbles_finish_in_same_tick() {
        let mut controller = RoundController::new(test_config());
        controller.tick(at(0));

        assert!(controller.force_start(controller.now()));
        assert_eq!(controller.phase(), RoundPhase::Finished);
        assert!(controller.state().finish_order.is_empty());

        let events = controller.take_events();
        assert!(events.iter().any(|e| matches!(e, RoundEvent::Finished(r) if r.finish_order.is_empty())));
    }

    #[test]
    fn test_removed_before_race_never_finishes() {
        let mut controller = RoundController::new(test_config());
        controller.tick(at(0));
        let a = controller.enter(entry("a"), controller.now()).unwrap();
        let b = controller.enter(entry("b"), controller.now()).unwrap();
        assert!(controller.remove(a));
        assert!(!controller.remove(a));
        controller.force_start(controller.now());

        drop_below_finish(&mut controller, b);
        controller.tick(at(1));

        let order: Vec<MarbleId> = controller
            .state()
            .finish_order
            .iter()
            .map(|e| e.entity_id)
            .collect();
        assert_eq!(order, vec![b]);
        assert_eq!(controller.phase(), RoundPhase::Finished);
    }

    #[test]
    fn test_single_marble_finish_scenario() {
        let mut config = test_config();
        config.round.enter_period = 5.0;
        let mut controller = RoundController::new(config);

        controller.tick(at(0));
        let id = controller.enter(entry("a"), controller.now()).unwrap();
        let other = controller.enter(entry("b"), controller.now()).unwrap();
        run(&mut controller, 1, ticks(12) - 1);
        assert_eq!(controller.phase(), RoundPhase::Racing);

        drop_below_finish(&mut controller, id);
        run(&mut controller, ticks(12), ticks(20));

        let order = &controller.state().finish_order;
        assert_eq!(order.len(), 1);
        assert_eq!(order[0].entity_id, id);
        let finish = order[0].finish_time.as_secs_f64();
        assert!((finish - 12.0).abs() < 0.05, "finished at {finish}");
        assert!((order[0].race_time.as_secs_f64() - 7.0).abs() < 0.05);
        assert!(controller.table().get(id).unwrap().finished);
        assert!(!controller.table().get(other).unwrap().finished);
    }

    #[test]
    fn test_max_round_length_scenario() {
        let mut config = test_config();
        config.round.enter_period = 0.0;
        let mut controller = RoundController::new(config);

        controller.tick(at(0));
        let id = controller.enter(entry("a"), controller.now()).unwrap();
        controller.tick(at(1));
        assert_eq!(controller.phase(), RoundPhase::Racing);
        let started = controller.state().started_at.unwrap();
        assert_eq!(started, at(1));

        run(&mut controller, 2, ticks(160));
        assert_eq!(controller.phase(), RoundPhase::Racing);

        controller.tick(at(ticks(160) + 1));
        assert_eq!(controller.phase(), RoundPhase::Finished);
        assert!(controller.state().finish_order.is_empty());

        let results = controller.last_results().unwrap();
        assert_eq!(results.placing(id), None);
        assert_eq!(results.participants.len(), 1);
    }

    #[test]
    fn test_all_finished_ends_race_and_reset_follows() {
        let mut config = test_config();
        config.round.wait_after_finish = 2.0;
        let mut controller = RoundController::new(config);

        controller.tick(at(0));
        let ids: Vec<MarbleId> = ["a", "b", "c"]
            .iter()
            .map(|o| controller.enter(entry(o), controller.now()).unwrap())
            .collect();
        controller.force_start(controller.now());

        // Two finish in the same tick, one later.
        drop_below_finish(&mut controller, ids[2]);
        drop_below_finish(&mut controller, ids[0]);
        controller.tick(at(10));
        assert_eq!(controller.phase(), RoundPhase::Racing);
        drop_below_finish(&mut controller, ids[1]);
        controller.tick(at(20));
        assert_eq!(controller.phase(), RoundPhase::Finished);

        let order = controller.state().finish_order.clone();
        let by_id: Vec<MarbleId> = order.iter().map(|e| e.entity_id).collect();
        assert_eq!(by_id, vec![ids[0], ids[2], ids[1]]);
        assert!(order.windows(2).all(|w| w[0].finish_time < w[1].finish_time));

        // Finished results stay queryable through the cooldown.
        run(&mut controller, 21, 20 + ticks(2) - 1);
        assert_eq!(controller.phase(), RoundPhase::Finished);
        controller.tick(at(20 + ticks(2)));

        assert_eq!(controller.phase(), RoundPhase::Entering);
        assert_eq!(controller.state().round, 2);
        assert!(controller.table().is_empty());
        assert_eq!(controller.world().dynamic_body_count(), 0);
        assert_eq!(controller.last_results().unwrap().finish_order, order);
        assert_eq!(controller.enter(entry("z"), controller.now()).unwrap(), 0);
    }

    #[test]
    fn test_finish_is_edge_triggered() {
        let mut controller = RoundController::new(test_config());
        controller.tick(at(0));
        let a = controller.enter(entry("a"), controller.now()).unwrap();
        controller.enter(entry("b"), controller.now()).unwrap();
        controller.force_start(controller.now());

        drop_below_finish(&mut controller, a);
        run(&mut controller, 1, 200);

        let count = controller
            .state()
            .finish_order
            .iter()
            .filter(|e| e.entity_id == a)
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_force_end_from_entering() {
        let mut controller = RoundController::new(test_config());
        controller.tick(at(0));
        controller.enter(entry("a"), controller.now()).unwrap();

        assert!(controller.force_end(controller.now()));
        assert!(!controller.force_end(controller.now()));
        assert_eq!(controller.phase(), RoundPhase::Finished);
        assert_eq!(controller.enter(entry("b"), controller.now()), Err(EntryError::NotAccepting(RoundPhase::Finished)));
    }

    #[test]
    fn test_huge_round_length_saturates_deadline() {
        let mut config = test_config();
        config.round.max_round_length = 1e300;
        let mut controller = RoundController::new(config);
        controller.tick(at(0));
        controller.enter(entry("a"), controller.now()).unwrap();

        assert!(controller.force_start(controller.now()));
        assert_eq!(controller.state().ends_no_later_than, Some(Duration::MAX));
        run(&mut controller, 1, ticks(1));
        assert_eq!(controller.phase(), RoundPhase::Racing);
        assert_eq!(controller.status(controller.now()).time_remaining_ms, Some(u64::MAX));
    }

    #[test]
    fn test_orphan_body_aborts_round() {
        let mut controller = RoundController::new(test_config());
        controller.tick(at(0));
        controller.enter(entry("a"), controller.now()).unwrap();
        controller.world.spawn_body(0.2, 1.0, 999);

        let events = controller.tick(at(1));
        assert!(events.iter().any(|e| matches!(e, RoundEvent::Finished(r) if r.aborted)));
        assert!(events.contains(&RoundEvent::Reset { round: 2 }));
        assert_eq!(controller.phase(), RoundPhase::Entering);
        assert_eq!(controller.state().round, 2);
        assert_eq!(controller.world().dynamic_body_count(), 0);
        assert!(controller.table().is_empty());
    }

    #[test]
    fn test_status_reports_time_remaining() {
        let mut controller = RoundController::new(test_config());
        controller.tick(at(0));
        controller.enter(entry("a"), controller.now()).unwrap();
        run(&mut controller, 1, ticks(10));

        let status = controller.status(controller.now());
        assert_eq!(status.phase, RoundPhase::Entering);
        assert_eq!(status.time_remaining_ms, Some(30_000));
        assert_eq!(status.live, 1);
        assert_eq!(status.server_time_ms, 10_000);
    }

    #[test]
    fn test_finish_event_serializes_seconds() {
        let event = FinishEvent {
            entity_id: 3,
            finish_time: Duration::from_millis(12_500),
            race_time: Duration::from_millis(2_250),
        };
        let json = serde_json::to_value(event).unwrap();
        assert_eq!(json["finish_time"], 12.5);
        assert_eq!(json["race_time"], 2.25);
        let back: FinishEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(24))]

        #[test]
        fn test_finish_order_strictly_increasing(drops in proptest::collection::vec(0u64..30, 1..8)) {
            let mut controller = RoundController::new(test_config());
            controller.tick(at(0));
            let ids: Vec<MarbleId> = (0..drops.len())
                .map(|i| controller.enter(entry(&format!("p{i}")), controller.now()).unwrap())
                .collect();
            controller.force_start(controller.now());

            for tick in 1..=31 {
                for (id, drop_at) in ids.iter().zip(&drops) {
                    if *drop_at + 1 == tick {
                        drop_below_finish(&mut controller, *id);
                    }
                }
                controller.tick(at(tick));
            }

            let order = controller.last_results().unwrap().finish_order.clone();
            proptest::prop_assert_eq!(order.len(), ids.len());
            proptest::prop_assert!(order.windows(2).all(|w| w[0].finish_time < w[1].finish_time));
            let mut seen: Vec<MarbleId> = order.iter().map(|e| e.entity_id).collect();
            seen.sort_unstable();
            seen.dedup();
            proptest::prop_assert_eq!(seen.len(), ids.len());
        }
    }
}
