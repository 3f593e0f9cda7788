//! Controller state shared between the poll loop and the request path
//!
//! The state is published as an immutable [`Snapshot`] behind a single lock.
//! Readers clone the `Arc` and never see a half-updated (side, target) pair.

use crate::signature::Signature;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

/// One of the two environment slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    A,
    B,
}

impl Side {
    /// The side that is not `self`
    pub fn other(self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::A => "a",
            Side::B => "b",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the controller is in its poll cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Building,
    Swapping,
}

/// A fully built, ready environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub side: Side,
    pub address: SocketAddr,
    pub built_signature: Signature,
    pub ready: bool,
}

/// Immutable view of the controller
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub active_side: Side,
    pub last_applied_signature: Option<Signature>,
    pub target: Option<SocketAddr>,
    pub phase: Phase,
    pub last_error: Option<String>,
    pub last_poll: Option<DateTime<Utc>>,
    pub builds_succeeded: u64,
    pub builds_failed: u64,
}

impl Snapshot {
    /// Nothing built yet; the first build lands on side B
    pub fn initial() -> Self {
        Self {
            active_side: Side::A,
            last_applied_signature: None,
            target: None,
            phase: Phase::Idle,
            last_error: None,
            last_poll: None,
            builds_succeeded: 0,
            builds_failed: 0,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.target.is_some()
    }

    /// The side a new build should go to
    pub fn inactive_side(&self) -> Side {
        self.active_side.other()
    }
}

/// Single synchronization point for controller state
#[derive(Debug, Clone)]
pub struct SharedState {
    inner: Arc<RwLock<Arc<Snapshot>>>,
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(Snapshot::initial()))),
        }
    }

    /// Current snapshot; cheap to call once per request
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.inner.read())
    }

    /// Current serving target, if any build has completed
    pub fn target(&self) -> Option<SocketAddr> {
        self.inner.read().target
    }

    /// Publish a new snapshot derived from the current one
    pub fn update<F>(&self, f: F) -> Arc<Snapshot>
    where
        F: FnOnce(&mut Snapshot),
    {
        let mut guard = self.inner.write();
        let mut next = Snapshot::clone(&guard);
        f(&mut next);
        let next = Arc::new(next);
        *guard = Arc::clone(&next);
        next
    }

    /// Expose a ready environment: side, target and signature change together.
    /// An environment that is not ready is refused and nothing is published.
    pub fn swap_to(&self, env: &Environment) -> Option<Arc<Snapshot>> {
        if !env.ready {
            return None;
        }
        Some(self.update(|s| {
            s.active_side = env.side;
            s.target = Some(env.address);
            s.last_applied_signature = Some(env.built_signature.clone());
            s.phase = Phase::Idle;
            s.last_error = None;
            s.builds_succeeded += 1;
        }))
    }

    pub fn set_phase(&self, phase: Phase) {
        self.update(|s| s.phase = phase);
    }

    /// Record a failed build without touching side, target or signature
    pub fn record_failure(&self, error: &str) {
        self.update(|s| {
            s.phase = Phase::Idle;
            s.last_error = Some(error.to_string());
            s.builds_failed += 1;
        });
    }

    pub fn record_poll(&self, at: DateTime<Utc>) {
        self.update(|s| s.last_poll = Some(at));
    }
}
