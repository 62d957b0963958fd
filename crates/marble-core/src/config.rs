//! Static game configuration, loaded once at process start.
//!
//! All coordinates in [`TrackConfig`] are in simulation space (Z-up). Durations
//! are stored as seconds so the JSON stays hand-editable.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::track::{StartGate, StaticBox};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config value `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

/// Longest accepted round timer.
pub const MAX_ROUND_TIMER_SECS: f64 = 24.0 * 60.0 * 60.0;

fn invalid(field: &'static str, reason: &'static str) -> ConfigError {
    ConfigError::Invalid { field, reason }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    pub physics: PhysicsConfig,
    pub track: TrackConfig,
    pub round: RoundConfig,
    pub marbles: MarbleConfig,
    pub replication: ReplicationConfig,
}

impl GameConfig {
    /// Parses and validates a JSON document. Missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let physics = &self.physics;
        if physics.steps == 0 {
            return Err(invalid("physics.steps", "must be at least 1"));
        }
        if physics.gravity.iter().any(|g| !g.is_finite()) {
            return Err(invalid("physics.gravity", "must be finite"));
        }
        if !physics.finish_threshold.is_finite() {
            return Err(invalid("physics.finish_threshold", "must be finite"));
        }
        if physics.max_catch_up == 0 {
            return Err(invalid("physics.max_catch_up", "must be at least 1"));
        }

        if self.track.gates.is_empty() {
            return Err(invalid("track.gates", "at least one start gate is required"));
        }
        for gate in &self.track.gates {
            if gate.half_extents.iter().any(|h| h.is_nan() || *h <= 0.0) {
                return Err(invalid("track.gates.half_extents", "must be positive"));
            }
        }
        for collider in &self.track.colliders {
            if collider.half_extents.iter().any(|h| h.is_nan() || *h <= 0.0) {
                return Err(invalid("track.colliders.half_extents", "must be positive"));
            }
        }

        let round = &self.round;
        for (field, secs) in [
            ("round.enter_period", round.enter_period),
            ("round.max_round_length", round.max_round_length),
            ("round.wait_after_finish", round.wait_after_finish),
        ] {
            if Duration::try_from_secs_f64(secs).is_err() {
                return Err(invalid(field, "must be a non-negative number of seconds"));
            }
            if secs > MAX_ROUND_TIMER_SECS {
                return Err(invalid(field, "must not exceed 24 hours"));
            }
        }

        let marbles = &self.marbles;
        if marbles.min_radius.is_nan()
            || marbles.min_radius <= 0.0
            || marbles.max_radius.is_nan()
            || marbles.max_radius < marbles.min_radius
        {
            return Err(invalid(
                "marbles.min_radius",
                "radius range must be positive and ordered",
            ));
        }
        if marbles.density.is_nan() || marbles.density <= 0.0 {
            return Err(invalid("marbles.density", "must be positive"));
        }
        if marbles.max_per_owner == 0 {
            return Err(invalid("marbles.max_per_owner", "must be at least 1"));
        }
        if marbles.max_name_len == 0 {
            return Err(invalid("marbles.max_name_len", "must be at least 1"));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PhysicsConfig {
    /// Gravity in simulation space (Z-up).
    pub gravity: [f32; 3],
    /// Physics ticks per second.
    pub steps: u32,
    /// Network-space height below which a marble counts as finished.
    pub finish_threshold: f32,
    /// Spawn RNG seed; random when absent.
    pub seed: Option<u64>,
    /// Upper bound on ticks run to catch up after a stall.
    pub max_catch_up: u32,
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self {
            gravity: [0.0, 0.0, -9.81],
            steps: 120,
            finish_threshold: -5.0,
            seed: None,
            max_catch_up: 8,
        }
    }
}

impl PhysicsConfig {
    pub fn step_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.steps.max(1)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackConfig {
    pub gates: Vec<StartGate>,
    pub colliders: Vec<StaticBox>,
}

impl Default for TrackConfig {
    fn default() -> Self {
        Self {
            gates: vec![StartGate {
                name: "main".to_string(),
                position: [0.0, 3.0, 14.0],
                half_extents: [3.0, 1.5, 1.0],
                yaw: 0.0,
            }],
            colliders: vec![
                // Main ramp, sloping down along +y.
                StaticBox {
                    center: [0.0, 16.0, 6.0],
                    half_extents: [4.0, 16.0, 0.25],
                    rotation: [-0.35, 0.0, 0.0],
                    friction: 0.3,
                    restitution: 0.4,
                },
                StaticBox {
                    center: [-4.25, 16.0, 7.0],
                    half_extents: [0.25, 16.0, 1.5],
                    rotation: [-0.35, 0.0, 0.0],
                    friction: 0.1,
                    restitution: 0.5,
                },
                StaticBox {
                    center: [4.25, 16.0, 7.0],
                    half_extents: [0.25, 16.0, 1.5],
                    rotation: [-0.35, 0.0, 0.0],
                    friction: 0.1,
                    restitution: 0.5,
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoundConfig {
    pub enter_period: f64,
    pub max_round_length: f64,
    pub wait_after_finish: f64,
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            enter_period: 40.0,
            max_round_length: 160.0,
            wait_after_finish: 10.0,
        }
    }
}

// Unvalidated values saturate instead of panicking.
fn secs_to_duration(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

impl RoundConfig {
    pub fn enter_period(&self) -> Duration {
        secs_to_duration(self.enter_period)
    }

    pub fn max_round_length(&self) -> Duration {
        secs_to_duration(self.max_round_length)
    }

    pub fn wait_after_finish(&self) -> Duration {
        secs_to_duration(self.wait_after_finish)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarbleConfig {
    pub min_radius: f32,
    pub max_radius: f32,
    pub density: f32,
    /// Marbles a single owner may have in one round. Anonymous entries are not limited.
    pub max_per_owner: usize,
    /// Maximum display name length, in characters.
    pub max_name_len: usize,
}

impl Default for MarbleConfig {
    fn default() -> Self {
        Self {
            min_radius: 0.2,
            max_radius: 0.3,
            density: 1.0,
            max_per_owner: 1,
            max_name_len: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Maximum snapshot responses per second per client.
    pub tickrate: u32,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self { tickrate: 15 }
    }
}

impl ReplicationConfig {
    /// Minimum spacing between two responses to the same client.
    pub fn response_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tickrate.max(1)))
    }
}
