//! Initial drawing sync.
//!
//! ```text
//!  Idle ──start()──► AwaitingSnapshot ──snapshots()──► BaselineCommitted
//!                          │                                  │
//!                          └──── deadline passed ─────────────┘
//!                                (local state becomes baseline)
//! ```
//!
//! `start()` may be called again after a reconnect. Snapshots are applied
//! with remote origin on top of the existing replica, which is idempotent
//! per record id, so a repeated sync never duplicates records. Only the
//! first sync adopts the local state as baseline; on a resync, local edits
//! the peers have not seen stay pending so they are still sent.

use std::time::{Duration, Instant};
use tandem_core::{DrawingRecord, DrawingScene, Origin, RawPatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    Idle,
    AwaitingSnapshot { deadline: Instant },
    BaselineCommitted,
}

/// What a snapshot batch did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub snapshots: usize,
    pub applied: usize,
    pub skipped: usize,
}

#[derive(Debug)]
pub struct Bootstrapper {
    state: BootstrapState,
    timeout: Duration,
    syncs: u32,
}

impl Bootstrapper {
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: BootstrapState::Idle,
            timeout,
            syncs: 0,
        }
    }

    /// Enter `AwaitingSnapshot`. The caller sends the ready signal.
    pub fn start(&mut self, now: Instant) {
        log::debug!("Drawing sync requested");
        self.state = BootstrapState::AwaitingSnapshot {
            deadline: now + self.timeout,
        };
    }

    /// Apply an ordered batch of snapshots and commit the baseline.
    ///
    /// Snapshots that arrive while no sync is outstanding are still applied
    /// (they are remote state) but do not move the state machine.
    pub fn snapshots(&mut self, scene: &mut DrawingScene, batch: &[RawPatch]) -> SyncSummary {
        let mut summary = SyncSummary {
            snapshots: batch.len(),
            ..SyncSummary::default()
        };

        for raw in batch {
            let (patch, anomalies) = raw.decode::<DrawingRecord>();
            summary.skipped += anomalies.len();
            summary.applied += scene.replica_mut().apply(&patch, Origin::Remote).changed();
        }

        if self.is_awaiting() {
            self.commit(scene);
        }
        summary
    }

    /// Commit the local state if the snapshot did not arrive in time.
    pub fn poll(&mut self, scene: &mut DrawingScene, now: Instant) -> bool {
        match self.state {
            BootstrapState::AwaitingSnapshot { deadline } if deadline <= now => {
                log::warn!("No drawing snapshot received; using local state as baseline");
                self.commit(scene);
                true
            }
            _ => false,
        }
    }

    fn commit(&mut self, scene: &mut DrawingScene) {
        if self.syncs == 0 {
            scene.replica_mut().commit_baseline();
        } else {
            let pending = scene.replica().pending_local();
            if !pending.is_empty() {
                log::info!("Keeping {} unsent local drawing changes", pending.len());
            }
        }
        self.syncs += 1;
        self.state = BootstrapState::BaselineCommitted;
        log::info!(
            "Drawing baseline committed with {} records",
            scene.replica().len()
        );
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match self.state {
            BootstrapState::AwaitingSnapshot { deadline } => Some(deadline),
            _ => None,
        }
    }

    pub fn reset(&mut self) {
        self.state = BootstrapState::Idle;
    }

    pub fn state(&self) -> BootstrapState {
        self.state
    }

    pub fn is_awaiting(&self) -> bool {
        matches!(self.state, BootstrapState::AwaitingSnapshot { .. })
    }

    pub fn is_committed(&self) -> bool {
        self.state == BootstrapState::BaselineCommitted
    }

    /// Number of completed syncs.
    pub fn syncs(&self) -> u32 {
        self.syncs
    }
}
