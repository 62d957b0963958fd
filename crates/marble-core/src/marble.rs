//! Marble entities and the entity table.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::MarbleConfig;
use crate::physics::BodyHandle;
use crate::round::RoundPhase;

/// Dense marble identifier, restarted from zero after each round reset.
pub type MarbleId = u32;

/// External user identifier (chat account, guest token, ...).
pub type OwnerId = String;

/// RGB color.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Predefined colors for marbles.
    pub const RED: Color = Color::rgb(255, 0, 0);
    pub const BLUE: Color = Color::rgb(0, 0, 255);
    pub const GREEN: Color = Color::rgb(0, 255, 0);
    pub const YELLOW: Color = Color::rgb(255, 255, 0);
    pub const PURPLE: Color = Color::rgb(128, 0, 128);
    pub const ORANGE: Color = Color::rgb(255, 165, 0);
    pub const CYAN: Color = Color::rgb(0, 255, 255);
    pub const PINK: Color = Color::rgb(255, 192, 203);

    pub const PALETTE: [Color; 8] = [
        Self::RED,
        Self::BLUE,
        Self::GREEN,
        Self::YELLOW,
        Self::PURPLE,
        Self::ORANGE,
        Self::CYAN,
        Self::PINK,
    ];

    /// Parses `#rrggbb` or `rrggbb`.
    pub fn from_hex(value: &str) -> Option<Self> {
        let hex = value.strip_prefix('#').unwrap_or(value);
        if hex.len() != 6 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
        Some(Self::rgb(channel(0)?, channel(2)?, channel(4)?))
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

/// Mass of a solid sphere; matches what the physics collider derives from density.
pub fn mass_for_radius(radius: f32, density: f32) -> f32 {
    density * 4.0 / 3.0 * std::f32::consts::PI * radius.powi(3)
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum EntryError {
    #[error("Display name must not be empty")]
    EmptyName,

    #[error("Display name is longer than {0} characters")]
    NameTooLong(usize),

    #[error("Display name contains control characters")]
    InvalidName,

    #[error("Invalid color `{0}`, expected #rrggbb")]
    InvalidColor(String),

    #[error("Owner already has {0} marble(s) in this round")]
    OwnerLimit(usize),

    #[error("Entries are closed while the round is {0}")]
    NotAccepting(RoundPhase),
}

/// Entry request as received from a collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntryRequest {
    #[serde(default)]
    pub owner_id: Option<OwnerId>,
    pub display_name: String,
    #[serde(default)]
    pub color: Option<String>,
}

/// Entry request that passed the stateless checks.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedEntry {
    pub owner_id: Option<OwnerId>,
    pub display_name: String,
    pub color: Option<Color>,
}

impl EntryRequest {
    /// Checks name and color. Owner limits depend on round state and are
    /// enforced when the entry is applied.
    pub fn validate(self, config: &MarbleConfig) -> Result<ValidatedEntry, EntryError> {
        let display_name = self.display_name.trim().to_string();
        if display_name.is_empty() {
            return Err(EntryError::EmptyName);
        }
        if display_name.chars().count() > config.max_name_len {
            return Err(EntryError::NameTooLong(config.max_name_len));
        }
        if display_name.chars().any(char::is_control) {
            return Err(EntryError::InvalidName);
        }

        let color = match self.color {
            Some(raw) => Some(Color::from_hex(raw.trim()).ok_or(EntryError::InvalidColor(raw))?),
            None => None,
        };

        Ok(ValidatedEntry {
            owner_id: self.owner_id.filter(|owner| !owner.is_empty()),
            display_name,
            color,
        })
    }
}

/// A racing marble.
#[derive(Debug, Clone)]
pub struct MarbleEntity {
    pub id: MarbleId,
    pub owner_id: Option<OwnerId>,
    pub display_name: String,
    pub color: Color,
    /// Radius.
    pub size: f32,
    pub mass: f32,
    pub body: BodyHandle,
    pub finished: bool,
    pub finish_time: Option<Duration>,
}

/// Public view of a marble for clients and collaborators.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RosterEntry {
    pub id: MarbleId,
    pub owner_id: Option<OwnerId>,
    pub display_name: String,
    pub color: Color,
    pub size: f32,
    pub finished: bool,
}

impl From<&MarbleEntity> for RosterEntry {
    fn from(marble: &MarbleEntity) -> Self {
        Self {
            id: marble.id,
            owner_id: marble.owner_id.clone(),
            display_name: marble.display_name.clone(),
            color: marble.color,
            size: marble.size,
            finished: marble.finished,
        }
    }
}

/// Owns the live marbles in insertion order.
#[derive(Debug, Default)]
pub struct EntityTable {
    marbles: Vec<MarbleEntity>,
    next_id: MarbleId,
}

impl EntityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id the next insert will receive.
    pub fn peek_next_id(&self) -> MarbleId {
        self.next_id
    }

    /// Inserts a marble built around a fresh id and returns that id.
    pub fn insert_with(&mut self, build: impl FnOnce(MarbleId) -> MarbleEntity) -> MarbleId {
        let id = self.next_id;
        self.next_id += 1;
        let marble = build(id);
        debug_assert_eq!(marble.id, id);
        self.marbles.push(marble);
        id
    }

    pub fn remove(&mut self, id: MarbleId) -> Option<MarbleEntity> {
        let pos = self.marbles.iter().position(|m| m.id == id)?;
        Some(self.marbles.remove(pos))
    }

    pub fn get(&self, id: MarbleId) -> Option<&MarbleEntity> {
        self.marbles.iter().find(|m| m.id == id)
    }

    pub fn get_mut(&mut self, id: MarbleId) -> Option<&mut MarbleEntity> {
        self.marbles.iter_mut().find(|m| m.id == id)
    }

    /// Live marbles in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &MarbleEntity> {
        self.marbles.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut MarbleEntity> {
        self.marbles.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.marbles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marbles.is_empty()
    }

    pub fn finished_count(&self) -> usize {
        self.marbles.iter().filter(|m| m.finished).count()
    }

    pub fn owned_by(&self, owner: &str) -> usize {
        self.marbles
            .iter()
            .filter(|m| m.owner_id.as_deref() == Some(owner))
            .count()
    }

    pub fn roster(&self) -> Vec<RosterEntry> {
        self.marbles.iter().map(RosterEntry::from).collect()
    }

    /// Empties the table and restarts ids. Bodies are returned to the caller.
    pub fn clear(&mut self) -> Vec<MarbleEntity> {
        self.next_id = 0;
        std::mem::take(&mut self.marbles)
    }
}
