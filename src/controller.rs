//! Side manager: the blue-green update loop
//!
//! Each cycle fetches upstream heads, skips when the signature is unchanged,
//! builds the inactive side otherwise, and swaps it in once ready. Cycles are
//! strictly sequential; request serving reads [`SharedState`] concurrently and
//! only ever sees the published pair.

use crate::builder::{BuildError, EnvironmentBuilder};
use crate::config::RetryPolicy;
use crate::metadata::HeadSource;
use crate::signature::{has_changed, select_heads, Signature};
use crate::state::{Phase, SharedState, Side};
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Result of one poll cycle
#[derive(Debug)]
pub enum PollOutcome {
    /// Metadata unavailable or incomplete this cycle
    NoMetadata,
    /// Upstream has not moved since the last successful build
    Unchanged,
    /// A new environment is serving
    Swapped { side: Side, address: SocketAddr },
    /// The build failed; the previous side keeps serving
    BuildFailed { side: Side, error: BuildError },
}

impl PollOutcome {
    pub fn is_build_failure(&self) -> bool {
        matches!(self, PollOutcome::BuildFailed { .. })
    }
}

pub struct SideManager {
    source: Arc<dyn HeadSource>,
    tracked: Vec<String>,
    builder: EnvironmentBuilder,
    state: SharedState,
    interval: Duration,
    retry: RetryPolicy,
}

impl SideManager {
    pub fn new(
        source: Arc<dyn HeadSource>,
        tracked: Vec<String>,
        builder: EnvironmentBuilder,
        state: SharedState,
        interval: Duration,
    ) -> Self {
        Self {
            source,
            tracked,
            builder,
            state,
            interval,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Run a single fetch, compare, build, swap cycle
    pub async fn poll_once(&self) -> PollOutcome {
        self.state.record_poll(Utc::now());

        let Some(fetched) = self.source.fetch().await else {
            debug!("No metadata this cycle");
            return PollOutcome::NoMetadata;
        };

        let Some(heads) = select_heads(&fetched, &self.tracked) else {
            debug!(tracked = ?self.tracked, "Metadata is missing a tracked repository");
            return PollOutcome::NoMetadata;
        };

        let signature = Signature::compute(&heads);
        let current = self.state.snapshot();
        if !has_changed(&signature, current.last_applied_signature.as_ref()) {
            debug!(signature = %signature.short(), "Upstream unchanged");
            return PollOutcome::Unchanged;
        }

        let side = current.inactive_side();
        info!(
            %side,
            signature = %signature.short(),
            heads = ?heads.iter().map(|h| format!("{}@{}", h.name, h.commit)).collect::<Vec<_>>(),
            "Upstream changed, building inactive side"
        );

        self.state.set_phase(Phase::Building);
        match self.builder.build(side, &heads, &signature).await {
            Ok(env) => {
                self.state.set_phase(Phase::Swapping);
                match self.state.swap_to(&env) {
                    Some(snapshot) => {
                        info!(
                            side = %snapshot.active_side,
                            address = %env.address,
                            signature = %signature.short(),
                            "Swapped serving side"
                        );
                        PollOutcome::Swapped {
                            side: env.side,
                            address: env.address,
                        }
                    }
                    None => self.fail(
                        side,
                        &signature,
                        BuildError::Launch(format!("environment on side {} is not ready", side)),
                    ),
                }
            }
            Err(e) => self.fail(side, &signature, e),
        }
    }

    fn fail(&self, side: Side, signature: &Signature, error: BuildError) -> PollOutcome {
        error!(%side, signature = %signature.short(), error = %error, "Build failed, keeping current side");
        self.state.record_failure(&error.to_string());
        PollOutcome::BuildFailed { side, error }
    }

    /// Poll until `shutdown_rx` flips to true or its sender is dropped.
    /// A cycle in progress is finished first.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            tracked = ?self.tracked,
            "Side manager started"
        );

        loop {
            let outcome = self.poll_once().await;
            let delay = self
                .retry
                .next_delay(self.interval, outcome.is_build_failure());

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                res = shutdown_rx.changed() => {
                    if res.is_err() || *shutdown_rx.borrow() {
                        info!("Side manager shutting down");
                        break;
                    }
                }
            }
        }
    }
}
