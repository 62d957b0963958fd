//! Physics simulation using `Rapier3D` with a fixed timestep.
//!
//! The simulation is Z-up. Transforms leave this module in network space, which
//! is Y-up: positions are read as `(x, z, y)` and rotations are conjugated by the
//! same axis swap. Nothing outside this module sees simulation coordinates.

use std::collections::HashSet;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rapier3d::prelude::*;

use crate::config::{PhysicsConfig, TrackConfig};
use crate::track::StartGate;

/// Opaque reference to a dynamic body owned by [`PhysicsWorld`].
///
/// Backed by Rapier's generational arena index, so a handle to a removed body
/// resolves to nothing instead of aliasing a newer body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BodyHandle(RigidBodyHandle);

/// World transform in network space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub position: [f32; 3],
    /// Quaternion as `[x, y, z, w]`.
    pub rotation: [f32; 4],
}

impl Transform {
    pub const IDENTITY: Transform = Transform {
        position: [0.0, 0.0, 0.0],
        rotation: [0.0, 0.0, 0.0, 1.0],
    };
}

/// Maps a simulation-space position to network space. The swap is its own inverse.
pub fn to_network_position(sim: [f32; 3]) -> [f32; 3] {
    [sim[0], sim[2], sim[1]]
}

/// Maps a simulation-space quaternion `[x, y, z, w]` to network space.
///
/// Swapping two axes is a reflection, so the rotation axis picks up a sign flip.
pub fn to_network_rotation(sim: [f32; 4]) -> [f32; 4] {
    [-sim[0], -sim[2], -sim[1], sim[3]]
}

/// Converts wall-clock time into whole physics ticks.
#[derive(Debug, Clone)]
pub struct FixedStep {
    step: Duration,
    accumulated: Duration,
    max_catch_up: u32,
}

impl FixedStep {
    pub fn new(step: Duration, max_catch_up: u32) -> Self {
        Self {
            step,
            accumulated: Duration::ZERO,
            max_catch_up: max_catch_up.max(1),
        }
    }

    pub fn step(&self) -> Duration {
        self.step
    }

    /// Adds elapsed time and returns the number of ticks to run now.
    ///
    /// At most `max_catch_up` ticks are returned; any backlog beyond that is
    /// dropped so a stalled loop does not spiral.
    pub fn advance(&mut self, elapsed: Duration) -> u32 {
        self.accumulated += elapsed;
        let mut ticks = 0;
        while self.accumulated >= self.step && ticks < self.max_catch_up {
            self.accumulated -= self.step;
            ticks += 1;
        }
        if self.accumulated >= self.step {
            tracing::warn!(
                dropped_ms = self.accumulated.as_millis(),
                "physics loop fell behind; dropping backlog"
            );
            self.accumulated = Duration::ZERO;
        }
        ticks
    }
}

/// Physics world containing all `Rapier3D` components plus the track layout.
pub struct PhysicsWorld {
    pub rigid_body_set: RigidBodySet,
    pub collider_set: ColliderSet,
    pub integration_parameters: IntegrationParameters,
    pub physics_pipeline: PhysicsPipeline,
    pub island_manager: IslandManager,
    pub broad_phase: DefaultBroadPhase,
    pub narrow_phase: NarrowPhase,
    pub impulse_joint_set: ImpulseJointSet,
    pub multibody_joint_set: MultibodyJointSet,
    pub ccd_solver: CCDSolver,
    pub gravity: Vector,
    pub frame: u64,
    gates: Vec<StartGate>,
    gate_floors: Vec<ColliderHandle>,
    finish_threshold: f32,
    // Bodies inserted since the last step have no simulated motion state yet.
    unstepped: HashSet<RigidBodyHandle>,
    rng: ChaCha8Rng,
}

impl fmt::Debug for PhysicsWorld {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicsWorld")
            .field("frame", &self.frame)
            .field("rigid_body_count", &self.rigid_body_set.len())
            .field("collider_count", &self.collider_set.len())
            .field("gates_open", &self.gates_open())
            .field("gravity", &self.gravity)
            .finish_non_exhaustive()
    }
}

impl PhysicsWorld {
    /// Creates a world with the given physics settings and static track.
    pub fn new(physics: &PhysicsConfig, track: &TrackConfig) -> Self {
        let integration_parameters = IntegrationParameters {
            dt: physics.step_duration().as_secs_f32(),
            ..Default::default()
        };
        let [gx, gy, gz] = physics.gravity;
        let seed = physics.seed.unwrap_or_else(|| rand::rng().random());

        let mut world = Self {
            rigid_body_set: RigidBodySet::new(),
            collider_set: ColliderSet::new(),
            integration_parameters,
            physics_pipeline: PhysicsPipeline::new(),
            island_manager: IslandManager::new(),
            broad_phase: DefaultBroadPhase::new(),
            narrow_phase: NarrowPhase::new(),
            impulse_joint_set: ImpulseJointSet::new(),
            multibody_joint_set: MultibodyJointSet::new(),
            ccd_solver: CCDSolver::new(),
            gravity: Vector::new(gx, gy, gz),
            frame: 0,
            gates: track.gates.clone(),
            gate_floors: Vec::new(),
            finish_threshold: physics.finish_threshold,
            unstepped: HashSet::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
        };

        for piece in &track.colliders {
            world.collider_set.insert(piece.to_collider());
        }
        world.close_gates();
        world
    }

    /// Advances the simulation by exactly one fixed tick.
    pub fn step(&mut self) {
        self.physics_pipeline.step(
            self.gravity,
            &self.integration_parameters,
            &mut self.island_manager,
            &mut self.broad_phase,
            &mut self.narrow_phase,
            &mut self.rigid_body_set,
            &mut self.collider_set,
            &mut self.impulse_joint_set,
            &mut self.multibody_joint_set,
            &mut self.ccd_solver,
            &(),
            &(),
        );
        self.frame += 1;
        self.unstepped.clear();
    }

    /// Advances the simulation by multiple ticks.
    pub fn step_n(&mut self, n: u32) {
        for _ in 0..n {
            self.step();
        }
    }

    /// Returns the current simulation frame number.
    pub fn current_frame(&self) -> u64 {
        self.frame
    }

    pub fn finish_threshold(&self) -> f32 {
        self.finish_threshold
    }

    /// Spawns a marble body at a random point inside a random start gate.
    pub fn spawn_body(&mut self, radius: f32, density: f32, user_data: u128) -> BodyHandle {
        let position = if self.gates.is_empty() {
            [0.0, 0.0, 0.0]
        } else {
            let index = self.rng.random_range(0..self.gates.len());
            self.gates[index].sample_point(radius, &mut self.rng)
        };
        self.add_body(position, radius, density, user_data)
    }

    /// Adds a dynamic ball at a simulation-space position.
    pub fn add_body(
        &mut self,
        position: [f32; 3],
        radius: f32,
        density: f32,
        user_data: u128,
    ) -> BodyHandle {
        let rigid_body = RigidBodyBuilder::dynamic()
            .translation(Vector::new(position[0], position[1], position[2]))
            .linear_damping(0.1)
            .angular_damping(0.2)
            .ccd_enabled(true)
            .user_data(user_data)
            .build();
        let handle = self.rigid_body_set.insert(rigid_body);

        let collider = ColliderBuilder::ball(radius)
            .restitution(0.5)
            .friction(0.3)
            .density(density)
            .build();
        self.collider_set
            .insert_with_parent(collider, handle, &mut self.rigid_body_set);

        self.unstepped.insert(handle);
        BodyHandle(handle)
    }

    /// Removes a body and its attached colliders. Returns false for unknown handles.
    pub fn remove_body(&mut self, handle: BodyHandle) -> bool {
        self.unstepped.remove(&handle.0);
        self.rigid_body_set
            .remove(
                handle.0,
                &mut self.island_manager,
                &mut self.collider_set,
                &mut self.impulse_joint_set,
                &mut self.multibody_joint_set,
                true,
            )
            .is_some()
    }

    pub fn contains(&self, handle: BodyHandle) -> bool {
        self.rigid_body_set.contains(handle.0)
    }

    /// Returns the network-space transform, or `None` if the body is unknown or
    /// has not been stepped since it was added.
    pub fn query_transform(&self, handle: BodyHandle) -> Option<Transform> {
        if self.unstepped.contains(&handle.0) {
            return None;
        }
        let body = self.rigid_body_set.get(handle.0)?;
        let t = body.translation();
        let r = body.rotation();
        Some(Transform {
            position: to_network_position([t.x, t.y, t.z]),
            rotation: to_network_rotation([r.x, r.y, r.z, r.w]),
        })
    }

    /// True when the body's network-space height is strictly below the finish threshold.
    pub fn below_finish_line(&self, handle: BodyHandle) -> bool {
        self.query_transform(handle)
            .is_some_and(|transform| transform.position[1] < self.finish_threshold)
    }

    /// Moves a body to a network-space position and clears its velocity.
    pub fn teleport(&mut self, handle: BodyHandle, position: [f32; 3]) -> bool {
        let Some(body) = self.rigid_body_set.get_mut(handle.0) else {
            return false;
        };
        let [x, y, z] = to_network_position(position);
        body.set_translation(Vector::new(x, y, z), true);
        body.set_linvel(Vector::new(0.0, 0.0, 0.0), true);
        true
    }

    pub fn dynamic_body_count(&self) -> usize {
        self.rigid_body_set
            .iter()
            .filter(|(_, body)| body.is_dynamic())
            .count()
    }

    /// Handles of all dynamic bodies, paired with their user data.
    pub fn dynamic_bodies(&self) -> Vec<(BodyHandle, u128)> {
        self.rigid_body_set
            .iter()
            .filter(|(_, body)| body.is_dynamic())
            .map(|(handle, body)| (BodyHandle(handle), body.user_data))
            .collect()
    }

    pub fn gates_open(&self) -> bool {
        self.gate_floors.is_empty()
    }

    /// Removes the gate floors so waiting marbles drop onto the track.
    pub fn open_gates(&mut self) {
        for handle in self.gate_floors.drain(..) {
            self.collider_set.remove(
                handle,
                &mut self.island_manager,
                &mut self.rigid_body_set,
                true,
            );
        }
    }

    /// Restores the gate floors.
    pub fn close_gates(&mut self) {
        if !self.gate_floors.is_empty() {
            return;
        }
        for gate in &self.gates {
            let handle = self.collider_set.insert(gate.floor_collider());
            self.gate_floors.push(handle);
        }
    }

    /// Removes every dynamic body and closes the gates. Static track geometry stays.
    pub fn reset(&mut self) -> usize {
        let handles: Vec<BodyHandle> = self
            .dynamic_bodies()
            .into_iter()
            .map(|(handle, _)| handle)
            .collect();
        let removed = handles.len();
        for handle in handles {
            self.remove_body(handle);
        }
        self.unstepped.clear();
        self.close_gates();
        removed
    }

    /// Computes a hash of all body states, used to compare runs.
    pub fn compute_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();

        self.frame.hash(&mut hasher);

        for (handle, body) in self.rigid_body_set.iter() {
            let (index, generation) = handle.into_raw_parts();
            index.hash(&mut hasher);
            generation.hash(&mut hasher);

            let pos = body.translation();
            for value in [pos.x, pos.y, pos.z] {
                hash_f32(value, &mut hasher);
            }
            let rot = body.rotation();
            for value in [rot.x, rot.y, rot.z, rot.w] {
                hash_f32(value, &mut hasher);
            }
            let linvel = body.linvel();
            for value in [linvel.x, linvel.y, linvel.z] {
                hash_f32(value, &mut hasher);
            }
        }

        hasher.finish()
    }
}

/// Hashes a f32 value by converting to bits.
fn hash_f32(value: f32, hasher: &mut impl Hasher) {
    value.to_bits().hash(hasher);
}
