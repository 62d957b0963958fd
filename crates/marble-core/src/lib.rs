//! Marble-Live Core Library
//!
//! Server-authoritative marble race simulation using `Rapier3D`: the physics
//! world and track, the round state machine, snapshot encoding and the wire
//! protocol used to replicate snapshots to clients.

#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod marble;
pub mod physics;
pub mod protocol;
pub mod round;
pub mod snapshot;
pub mod track;

pub use config::{ConfigError, GameConfig};
pub use marble::{Color, EntityTable, EntryError, EntryRequest, MarbleEntity, MarbleId, RosterEntry};
pub use physics::{BodyHandle, FixedStep, PhysicsWorld, Transform};
pub use protocol::{ClientMessage, Frame, Framing, MessageType, PROTOCOL_VERSION, ProtocolError, ServerMessage};
pub use round::{RoundController, RoundEvent, RoundPhase, RoundResults, RoundStatus};
pub use snapshot::{Snapshot, SnapshotEncoder};
