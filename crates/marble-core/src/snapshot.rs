//! World snapshots for replication.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::marble::{EntityTable, MarbleId};
use crate::physics::{PhysicsWorld, Transform};

/// Committed transforms of every live marble at one frame.
///
/// Rows follow entity table order. `positions` holds 3 floats per row and
/// `rotations` 4 (`x, y, z, w`), both in network space.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    frame: u64,
    server_time: Duration,
    ids: Vec<MarbleId>,
    positions: Vec<f32>,
    rotations: Vec<f32>,
}

impl Snapshot {
    /// Snapshot with no rows, used before the first tick.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn server_time(&self) -> Duration {
        self.server_time
    }

    pub fn ids(&self) -> &[MarbleId] {
        &self.ids
    }

    pub fn positions(&self) -> &[f32] {
        &self.positions
    }

    pub fn rotations(&self) -> &[f32] {
        &self.rotations
    }

    pub fn live_count(&self) -> usize {
        self.ids.len()
    }

    /// Transform of a row, or `None` if out of range.
    pub fn transform(&self, row: usize) -> Option<Transform> {
        let p = row.checked_mul(3)?;
        let r = row.checked_mul(4)?;
        let p = self.positions.get(p..p.checked_add(3)?)?;
        let r = self.rotations.get(r..r.checked_add(4)?)?;
        Some(Transform {
            position: [p[0], p[1], p[2]],
            rotation: [r[0], r[1], r[2], r[3]],
        })
    }
}

pub struct SnapshotEncoder;

impl SnapshotEncoder {
    /// Writes fresh buffers for all live marbles. Marbles without a committed
    /// transform are written at the origin with identity rotation.
    pub fn encode(
        table: &EntityTable,
        world: &PhysicsWorld,
        frame: u64,
        server_time: Duration,
    ) -> Snapshot {
        let live = table.len();
        let mut snapshot = Snapshot {
            frame,
            server_time,
            ids: Vec::with_capacity(live),
            positions: Vec::with_capacity(live * 3),
            rotations: Vec::with_capacity(live * 4),
        };

        for marble in table.iter() {
            let transform = world
                .query_transform(marble.body)
                .unwrap_or(Transform::IDENTITY);
            snapshot.ids.push(marble.id);
            snapshot.positions.extend_from_slice(&transform.position);
            snapshot.rotations.extend_from_slice(&transform.rotation);
        }

        debug_assert_eq!(snapshot.positions.len(), 3 * snapshot.ids.len());
        debug_assert_eq!(snapshot.rotations.len(), 4 * snapshot.ids.len());
        snapshot
    }
}
