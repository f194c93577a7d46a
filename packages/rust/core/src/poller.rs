//! Waits for the externally computed approval decision on finalized rows.
//!
//! The decision column is filled in by the store's own generation pipeline;
//! this module only observes it. Waiting is modelled as a [`PollState`]
//! (pending set, deadline, interval) driven by an injected [`Clock`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use granthub_shared::{Clock, PollerConfig, Result, RowId, StoreConfig, sleep_or_cancel};
use granthub_storage::TableStore;

// ---------------------------------------------------------------------------
// PollState
// ---------------------------------------------------------------------------

/// Rows still waiting for a decision, plus the deadline and poll interval.
#[derive(Debug, Clone)]
pub struct PollState {
    pending: Vec<RowId>,
    decisions: BTreeMap<RowId, String>,
    deadline: Instant,
    interval: Duration,
}

impl PollState {
    pub fn new(rows: &[RowId], started: Instant, timeout: Duration, interval: Duration) -> Self {
        let mut pending = Vec::with_capacity(rows.len());
        for row in rows {
            if !pending.contains(row) {
                pending.push(row.clone());
            }
        }
        Self {
            pending,
            decisions: BTreeMap::new(),
            deadline: started + timeout,
            interval,
        }
    }

    pub fn pending(&self) -> &[RowId] {
        &self.pending
    }

    pub fn resolve(&mut self, row: &RowId, decision: String) {
        self.pending.retain(|r| r != row);
        self.decisions.insert(row.clone(), decision);
    }

    /// Stop waiting on a row without a decision.
    pub fn drop_row(&mut self, row: &RowId) {
        self.pending.retain(|r| r != row);
    }

    pub fn is_settled(&self) -> bool {
        self.pending.is_empty()
    }

    /// How long to wait before the next round, or `None` once past the deadline.
    pub fn next_wait(&self, now: Instant) -> Option<Duration> {
        let remaining = self.deadline.checked_duration_since(now)?;
        (!remaining.is_zero()).then(|| remaining.min(self.interval))
    }

    fn finish(self, cancelled: bool, errors: Vec<String>) -> PollOutcome {
        PollOutcome {
            decisions: self.decisions,
            unresolved: self.pending,
            cancelled,
            errors,
        }
    }
}

/// What the poller observed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PollOutcome {
    /// Decision text per resolved row.
    pub decisions: BTreeMap<RowId, String>,
    /// Rows still without a decision when polling stopped.
    pub unresolved: Vec<RowId>,
    pub cancelled: bool,
    pub errors: Vec<String>,
}

// ---------------------------------------------------------------------------
// DecisionPoller
// ---------------------------------------------------------------------------

pub struct DecisionPoller {
    store: Arc<dyn TableStore>,
    clock: Arc<dyn Clock>,
    table_id: String,
    decision_column: String,
    interval: Duration,
    timeout: Duration,
}

impl DecisionPoller {
    pub fn new(
        store: Arc<dyn TableStore>,
        clock: Arc<dyn Clock>,
        store_config: &StoreConfig,
        config: &PollerConfig,
    ) -> Self {
        Self {
            store,
            clock,
            table_id: store_config.action_table_id.clone(),
            decision_column: store_config.columns.decision.clone(),
            interval: Duration::from_secs(config.interval_secs.max(1)),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Poll every pending row once per interval until each has a decision
    /// or the timeout passes. Rows left pending are unresolved, not failed.
    /// A read failure stops polling; remaining rows are reported unresolved.
    #[instrument(skip_all, fields(rows = rows.len()))]
    pub async fn wait_for_decisions(
        &self,
        rows: &[RowId],
        cancel: &CancellationToken,
    ) -> Result<PollOutcome> {
        let mut state = PollState::new(rows, self.clock.now(), self.timeout, self.interval);
        let mut errors = Vec::new();

        'poll: loop {
            for row_id in state.pending().to_vec() {
                if cancel.is_cancelled() {
                    return Ok(state.finish(true, errors));
                }
                match self.store.get_row(&self.table_id, &row_id).await {
                    Ok(Some(row)) => {
                        if let Some(decision) = row.text(&self.decision_column) {
                            info!(%row_id, %decision, "decision observed");
                            state.resolve(&row_id, decision);
                        }
                    }
                    Ok(None) => {
                        warn!(%row_id, "row disappeared while polling");
                        errors.push(format!("{row_id}: row not found while polling"));
                        state.drop_row(&row_id);
                    }
                    Err(e) => {
                        warn!(%row_id, error = %e, "poll read failed, stopping");
                        errors.push(format!("{row_id}: {e}"));
                        break 'poll;
                    }
                }
            }

            if state.is_settled() {
                break;
            }
            let Some(wait) = state.next_wait(self.clock.now()) else {
                break;
            };
            debug!(
                pending = state.pending().len(),
                wait_secs = wait.as_secs(),
                "waiting for decisions"
            );
            if !sleep_or_cancel(self.clock.as_ref(), wait, cancel).await {
                return Ok(state.finish(true, errors));
            }
        }

        let outcome = state.finish(false, errors);
        if !outcome.unresolved.is_empty() {
            info!(unresolved = outcome.unresolved.len(), "decisions still pending");
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MemoryStore, columns, store_config};
    use granthub_shared::ManualClock;
    use serde_json::json;

    const TABLE: &str = "scrap_result";

    fn poller(store: Arc<MemoryStore>, clock: Arc<ManualClock>) -> DecisionPoller {
        DecisionPoller::new(store, clock, &store_config(), &PollerConfig::default())
    }

    fn seed(store: &MemoryStore, id: &str) {
        store.seed(TABLE, id, columns(&[("grant_final", json!("{}"))]));
    }

    #[test]
    fn state_waits_at_most_one_interval() {
        let start = Instant::now();
        let state = PollState::new(
            &[RowId::from("a"), RowId::from("a")],
            start,
            Duration::from_secs(40),
            Duration::from_secs(15),
        );
        assert_eq!(state.pending().len(), 1);
        assert_eq!(state.next_wait(start), Some(Duration::from_secs(15)));
        assert_eq!(
            state.next_wait(start + Duration::from_secs(30)),
            Some(Duration::from_secs(10))
        );
        assert_eq!(state.next_wait(start + Duration::from_secs(40)), None);
    }

    #[tokio::test]
    async fn resolves_once_decision_appears() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "r1");
        store.set_after_reads("r1", 3, "grant_decider", "proceed to knowledge table sync");
        let clock = Arc::new(ManualClock::new());

        let outcome = poller(store, clock.clone())
            .wait_for_decisions(&[RowId::from("r1")], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            outcome.decisions.get(&RowId::from("r1")).map(String::as_str),
            Some("proceed to knowledge table sync")
        );
        assert!(outcome.unresolved.is_empty());
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(15); 2]);
    }

    #[tokio::test]
    async fn empty_decision_at_timeout_is_unresolved() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "r1");
        seed(&store, "r2");
        store.set_after_reads("r2", 1, "grant_decider", "reject");
        let clock = Arc::new(ManualClock::new());

        let outcome = poller(store, clock.clone())
            .wait_for_decisions(
                &[RowId::from("r1"), RowId::from("r2")],
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.unresolved, vec![RowId::from("r1")]);
        assert_eq!(outcome.decisions.len(), 1);
        assert!(!outcome.cancelled);
        assert_eq!(clock.elapsed(), Duration::from_secs(180));
        assert_eq!(clock.sleeps().len(), 12);
    }

    #[tokio::test]
    async fn cancellation_stops_between_rounds() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "r1");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = poller(store.clone(), Arc::new(ManualClock::new()))
            .wait_for_decisions(&[RowId::from("r1")], &cancel)
            .await
            .unwrap();

        assert!(outcome.cancelled);
        assert_eq!(outcome.unresolved, vec![RowId::from("r1")]);
        assert_eq!(*store.get_calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_rows_are_dropped() {
        let store = Arc::new(MemoryStore::new());
        let outcome = poller(store, Arc::new(ManualClock::new()))
            .wait_for_decisions(&[RowId::from("ghost")], &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.unresolved.is_empty());
        assert_eq!(outcome.errors.len(), 1);
    }
}
