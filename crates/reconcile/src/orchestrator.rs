//! Orchestrator: one level-triggered loop per reconciler, a shared status
//! board, and an optional publisher pushing the aggregate upward.

use std::sync::Arc;
use std::time::{Duration, Instant};

use filestore_core::{aggregate, AggregateCondition, Condition, FactKind};
use filestore_store::FactStore;
use metrics::{counter, histogram};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{ConditionPublisher, Reconciler};

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorConfig {
    /// Period of the unconditional resync pass.
    pub resync: Duration,
    /// Upper bound on a single pass; exceeding it reports Degraded.
    pub pass_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self { Self { resync: Duration::from_secs(60), pass_timeout: Duration::from_secs(120) } }
}

pub struct Orchestrator {
    facts: Arc<FactStore>,
    config: OrchestratorConfig,
    reconcilers: Vec<Arc<dyn Reconciler>>,
}

pub struct OrchestratorHandle {
    status: watch::Receiver<AggregateCondition>,
    tasks: Vec<JoinHandle<()>>,
}

impl OrchestratorHandle {
    pub fn status(&self) -> watch::Receiver<AggregateCondition> { self.status.clone() }

    /// Wait for every loop to exit; call after cancelling the shutdown token.
    pub async fn join(self) {
        for t in self.tasks {
            if let Err(e) = t.await {
                warn!(error = %e, "orchestrator task panicked");
            }
        }
    }
}

impl Orchestrator {
    pub fn new(facts: Arc<FactStore>, config: OrchestratorConfig) -> Self {
        Self { facts, config, reconcilers: Vec::new() }
    }

    pub fn register(mut self, reconciler: Arc<dyn Reconciler>) -> Self {
        self.reconcilers.push(reconciler);
        self
    }

    pub fn names(&self) -> Vec<&str> { self.reconcilers.iter().map(|r| r.name()).collect() }

    pub fn spawn(self, publisher: Option<Arc<dyn ConditionPublisher>>, shutdown: CancellationToken) -> OrchestratorHandle {
        let initial = Condition::progressing("Initializing", "waiting for first pass");
        let members: Vec<(String, Condition)> =
            self.reconcilers.iter().map(|r| (r.name().to_string(), initial.clone())).collect();
        let (board, status) = watch::channel(aggregate(members.iter().map(|(n, c)| (n.as_str(), c))));
        let board = Arc::new(board);

        let mut tasks = Vec::with_capacity(self.reconcilers.len() + 1);
        for (slot, reconciler) in self.reconcilers.into_iter().enumerate() {
            // Subscribe before spawning so no change published after spawn() is missed.
            let changes = self.facts.subscribe();
            tasks.push(tokio::spawn(run_loop(
                slot,
                reconciler,
                changes,
                board.clone(),
                self.config,
                shutdown.clone(),
            )));
        }
        if let Some(publisher) = publisher {
            tasks.push(tokio::spawn(publish_loop(publisher, status.clone(), shutdown)));
        }
        OrchestratorHandle { status, tasks }
    }
}

fn record(board: &watch::Sender<AggregateCondition>, slot: usize, name: &str, cond: Condition) {
    // Last writer wins; each loop only ever touches its own slot.
    board.send_modify(|agg| {
        if let Some(m) = agg.members.get_mut(slot) {
            m.1 = cond;
        }
        *agg = aggregate(agg.members.iter().map(|(n, c)| (n.as_str(), c)));
    });
    debug!(reconciler = %name, "status board updated");
}

/// Drain queued notifications; returns how many relevant triggers were folded.
fn coalesce(changes: &mut broadcast::Receiver<filestore_core::FactChange>, interests: &[FactKind]) -> usize {
    let mut folded = 0;
    loop {
        match changes.try_recv() {
            Ok(ch) if ch.touches(interests) => folded += 1,
            Ok(_) => {}
            Err(TryRecvError::Lagged(n)) => folded += n as usize,
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return folded,
        }
    }
}

async fn run_loop(
    slot: usize,
    reconciler: Arc<dyn Reconciler>,
    mut changes: broadcast::Receiver<filestore_core::FactChange>,
    board: Arc<watch::Sender<AggregateCondition>>,
    config: OrchestratorConfig,
    shutdown: CancellationToken,
) {
    let name = reconciler.name().to_string();
    let mut ticker = tokio::time::interval(config.resync);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut watching = true;
    info!(reconciler = %name, "reconcile loop started");
    loop {
        let trigger = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => "resync",
            res = changes.recv(), if watching => match res {
                Ok(ch) if ch.touches(reconciler.interests()) => "facts",
                Ok(_) => continue,
                // Missed notifications still mean something changed.
                Err(RecvError::Lagged(_)) => "facts",
                Err(RecvError::Closed) => {
                    warn!(reconciler = %name, "fact notifications closed; relying on resync");
                    watching = false;
                    continue;
                }
            },
        };
        let folded = coalesce(&mut changes, reconciler.interests());
        if folded > 0 {
            counter!("trigger_coalesced_total", folded as u64, "reconciler" => name.clone());
        }

        let t0 = Instant::now();
        let cond = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            res = tokio::time::timeout(config.pass_timeout, reconciler.reconcile()) => match res {
                Ok(cond) => cond,
                Err(_) => Condition::degraded(
                    "PassTimeout",
                    format!("{} pass exceeded {}s", name, config.pass_timeout.as_secs()),
                ),
            },
        };
        histogram!("reconcile_pass_latency_ms", t0.elapsed().as_secs_f64() * 1000.0, "reconciler" => name.clone());
        counter!("reconcile_passes_total", 1u64, "reconciler" => name.clone());
        if cond.is_degraded() {
            counter!("reconcile_degraded_total", 1u64, "reconciler" => name.clone());
            warn!(reconciler = %name, trigger, reason = %cond.reason, message = %cond.message, "pass degraded");
        } else {
            debug!(reconciler = %name, trigger, state = ?cond.state, reason = %cond.reason, "pass finished");
        }
        record(&board, slot, &name, cond);
        ticker.reset();
    }
    info!(reconciler = %name, "reconcile loop stopped");
}

async fn publish_loop(
    publisher: Arc<dyn ConditionPublisher>,
    mut status: watch::Receiver<AggregateCondition>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            res = status.changed() => if res.is_err() { break },
        }
        let current = status.borrow_and_update().clone();
        if let Err(e) = publisher.publish(&current).await {
            warn!(error = %e, "publishing operator status failed");
        }
    }
    debug!("status publisher stopped");
}
