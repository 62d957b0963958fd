//! Static track geometry and start gates.
//!
//! Everything here is authored in simulation space (Z-up). A start gate is a box
//! volume marbles are spawned into; a thin floor collider under each gate holds
//! them in place until the race starts.

use rand::Rng;
use rapier3d::prelude::{Collider, ColliderBuilder, Vector};
use serde::{Deserialize, Serialize};

/// Half thickness of the floor placed under each start gate.
pub const GATE_FLOOR_HALF_THICKNESS: f32 = 0.1;

/// Spawn volume for new marbles.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StartGate {
    #[serde(default)]
    pub name: String,
    /// Center of the volume.
    pub position: [f32; 3],
    pub half_extents: [f32; 3],
    /// Rotation about the vertical axis, in radians.
    #[serde(default)]
    pub yaw: f32,
}

impl StartGate {
    /// Draws a uniformly distributed point inside the gate, in world space.
    ///
    /// The volume is shrunk by `margin` on every axis where it is wide enough,
    /// so a marble of that radius starts fully inside the gate.
    pub fn sample_point(&self, margin: f32, rng: &mut impl Rng) -> [f32; 3] {
        let mut local = [0.0f32; 3];
        for (axis, half) in self.half_extents.iter().enumerate() {
            let usable = if *half > margin { half - margin } else { *half };
            local[axis] = rng.random_range(-usable..=usable);
        }
        self.to_world(local)
    }

    /// Transforms a gate-local offset into world space.
    pub fn to_world(&self, local: [f32; 3]) -> [f32; 3] {
        let (sin, cos) = self.yaw.sin_cos();
        [
            self.position[0] + local[0] * cos - local[1] * sin,
            self.position[1] + local[0] * sin + local[1] * cos,
            self.position[2] + local[2],
        ]
    }

    /// Returns true if a world-space point lies within the gate volume.
    pub fn contains(&self, point: [f32; 3]) -> bool {
        let (sin, cos) = self.yaw.sin_cos();
        let dx = point[0] - self.position[0];
        let dy = point[1] - self.position[1];
        let local = [
            dx * cos + dy * sin,
            -dx * sin + dy * cos,
            point[2] - self.position[2],
        ];
        local
            .iter()
            .zip(self.half_extents.iter())
            .all(|(v, half)| v.abs() <= half + 1e-4)
    }

    /// Builds the floor collider that holds marbles inside the gate.
    pub fn floor_collider(&self) -> Collider {
        let center = self.to_world([
            0.0,
            0.0,
            -self.half_extents[2] - GATE_FLOOR_HALF_THICKNESS,
        ]);
        ColliderBuilder::cuboid(
            self.half_extents[0],
            self.half_extents[1],
            GATE_FLOOR_HALF_THICKNESS,
        )
        .translation(Vector::new(center[0], center[1], center[2]))
        .rotation(Vector::new(0.0, 0.0, self.yaw))
        .friction(0.5)
        .build()
    }
}

/// Static box collider forming part of the track.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StaticBox {
    pub center: [f32; 3],
    pub half_extents: [f32; 3],
    /// Scaled-axis rotation, in radians.
    #[serde(default)]
    pub rotation: [f32; 3],
    #[serde(default = "default_friction")]
    pub friction: f32,
    #[serde(default = "default_restitution")]
    pub restitution: f32,
}

fn default_friction() -> f32 {
    0.3
}

fn default_restitution() -> f32 {
    0.4
}

impl StaticBox {
    pub fn to_collider(&self) -> Collider {
        let [hx, hy, hz] = self.half_extents;
        let [cx, cy, cz] = self.center;
        let [rx, ry, rz] = self.rotation;
        ColliderBuilder::cuboid(hx, hy, hz)
            .translation(Vector::new(cx, cy, cz))
            .rotation(Vector::new(rx, ry, rz))
            .friction(self.friction)
            .restitution(self.restitution)
            .build()
    }
}
