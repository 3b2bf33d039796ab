//! Tiering policy engine
//!
//! Planning is a pure function over index records: hot blobs idle past
//! `cool_after_idle` are cooled, then the least recently used hot blobs are
//! cooled until the hot footprint fits `max_hot_bytes`, then frequently read
//! cold blobs are warmed while the budget allows. Execution is best-effort.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TieringPolicy;
use crate::error::{ItemFailure, Result, StorageError};
use crate::hash::BlobHash;
use crate::index::BlobRecord;
use crate::manager::BlobManager;
use crate::store::Tier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TieringAction {
    CoolDown,
    WarmUp,
}

/// Why a move was planned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveReason {
    /// Not read or written for longer than `cool_after_idle`
    Idle,
    /// Evicted to bring the hot tier under `max_hot_bytes`
    OverBudget,
    /// Read often enough inside the access window
    Frequent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TieringMove {
    pub hash: BlobHash,
    pub action: TieringAction,
    pub reason: MoveReason,
    pub stored_size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TieringPlan {
    pub moves: Vec<TieringMove>,
    pub hot_bytes_before: u64,
    /// Projected hot footprint once every move succeeds
    pub hot_bytes_after: u64,
}

impl TieringPlan {
    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    pub fn count(&self, action: TieringAction) -> usize {
        self.moves.iter().filter(|m| m.action == action).count()
    }
}

/// Outcome of executing a plan
#[derive(Debug, Clone, Default, Serialize)]
pub struct TieringReport {
    pub planned: usize,
    pub cooled: usize,
    pub warmed: usize,
    /// Blobs that vanished between planning and execution
    pub skipped: usize,
    pub failures: Vec<ItemFailure>,
    pub cancelled: bool,
}

impl TieringReport {
    pub fn succeeded(&self) -> usize {
        self.cooled + self.warmed
    }

    /// Turn recorded failures into [`StorageError::PartialFailure`]
    pub fn ensure_complete(self) -> Result<Self> {
        if self.failures.is_empty() {
            return Ok(self);
        }
        Err(StorageError::PartialFailure {
            operation: "tiering",
            succeeded: self.succeeded(),
            failures: self.failures,
        })
    }
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or_default()
}

/// Decides and executes tier moves
#[derive(Debug, Clone)]
pub struct TieringPolicyEngine {
    policy: TieringPolicy,
}

impl TieringPolicyEngine {
    pub fn new(policy: TieringPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &TieringPolicy {
        &self.policy
    }

    /// Build the move plan for `records` as of `now`
    pub fn plan(&self, records: &[BlobRecord], now: DateTime<Utc>) -> TieringPlan {
        let policy = &self.policy;
        let mut hot: Vec<&BlobRecord> = records.iter().filter(|r| r.tier == Tier::Hot).collect();
        let hot_bytes_before: u64 = hot.iter().map(|r| r.stored_size).sum();
        let mut hot_bytes = hot_bytes_before;
        let mut moves = Vec::new();

        // Least recently used first
        hot.sort_by_key(|r| (r.last_activity(), r.hash));

        let mut remaining = Vec::with_capacity(hot.len());
        for record in hot {
            let idle = elapsed(record.last_activity(), now) >= policy.cool_after_idle();
            if idle && record.stored_size >= policy.min_cool_size {
                hot_bytes -= record.stored_size;
                moves.push(TieringMove {
                    hash: record.hash,
                    action: TieringAction::CoolDown,
                    reason: MoveReason::Idle,
                    stored_size: record.stored_size,
                });
            } else {
                remaining.push(record);
            }
        }

        for record in remaining {
            if hot_bytes <= policy.max_hot_bytes {
                break;
            }
            hot_bytes -= record.stored_size;
            moves.push(TieringMove {
                hash: record.hash,
                action: TieringAction::CoolDown,
                reason: MoveReason::OverBudget,
                stored_size: record.stored_size,
            });
        }

        if policy.warm_min_access_count > 0 {
            let window = policy.warm_access_window();
            let mut candidates: Vec<&BlobRecord> = records
                .iter()
                .filter(|r| r.tier == Tier::Cold)
                .filter(|r| r.access_count >= policy.warm_min_access_count)
                .filter(|r| {
                    r.last_accessed_at
                        .is_some_and(|at| elapsed(at, now) <= window)
                })
                .collect();
            // Most read first
            candidates.sort_by(|a, b| {
                b.access_count
                    .cmp(&a.access_count)
                    .then(b.last_accessed_at.cmp(&a.last_accessed_at))
                    .then(a.hash.cmp(&b.hash))
            });
            for record in candidates {
                if hot_bytes + record.stored_size > policy.max_hot_bytes {
                    continue;
                }
                hot_bytes += record.stored_size;
                moves.push(TieringMove {
                    hash: record.hash,
                    action: TieringAction::WarmUp,
                    reason: MoveReason::Frequent,
                    stored_size: record.stored_size,
                });
            }
        }

        TieringPlan {
            moves,
            hot_bytes_before,
            hot_bytes_after: hot_bytes,
        }
    }

    /// Plan against the manager's index and execute the moves
    ///
    /// A failed move is recorded and the rest still run. Cancellation stops
    /// before the next move; the move in flight completes.
    pub async fn apply(
        &self,
        manager: &BlobManager,
        cancel: &CancellationToken,
    ) -> Result<TieringReport> {
        manager.tiering_store()?;
        let plan = self.plan(&manager.records()?, Utc::now());
        let mut report = TieringReport {
            planned: plan.moves.len(),
            ..Default::default()
        };

        for mv in &plan.moves {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let result = match mv.action {
                TieringAction::CoolDown => manager.cool_down(&mv.hash).await,
                TieringAction::WarmUp => manager.warm_up(&mv.hash).await,
            };
            match result {
                Ok(()) => match mv.action {
                    TieringAction::CoolDown => report.cooled += 1,
                    TieringAction::WarmUp => report.warmed += 1,
                },
                Err(StorageError::NotFound(_)) => {
                    debug!(hash = %mv.hash, "Planned move target disappeared");
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(hash = %mv.hash, action = ?mv.action, "Tier move failed: {}", e);
                    report.failures.push(ItemFailure::new(mv.hash, &e));
                }
            }
        }

        info!(
            planned = report.planned,
            cooled = report.cooled,
            warmed = report.warmed,
            failed = report.failures.len(),
            cancelled = report.cancelled,
            "Tiering policy applied"
        );
        Ok(report)
    }
}
