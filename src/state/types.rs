//! Recorded deployment state.
//!
//! A record is kept per cluster/service. It carries what the last
//! successful run applied and a bounded history of every run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aws::Bindings;
use crate::reconciler::{RunKind, RunPhase};

/// Current version of the record format.
pub const STATE_VERSION: &str = "1";

/// Runs kept per record.
pub const MAX_HISTORY: usize = 100;

/// What is recorded about one cluster/service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    /// Record format version.
    pub version: String,
    /// Cluster name.
    pub cluster: String,
    /// Service name.
    pub service: String,
    /// Spec hash of the last successful apply.
    #[serde(default)]
    pub spec_hash: Option<String>,
    /// Identifiers resolved by the last apply.
    #[serde(default)]
    pub bindings: Bindings,
    /// Final phase of the last run.
    #[serde(default)]
    pub last_phase: Option<RunPhase>,
    /// When the record was last written.
    pub updated_at: DateTime<Utc>,
    /// Recent runs, oldest first.
    #[serde(default)]
    pub history: Vec<RunRecord>,
}

/// One entry in the run history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Run identifier.
    pub run_id: String,
    /// Command that started the run.
    pub kind: RunKind,
    /// Spec hash the run planned against.
    pub spec_hash: String,
    /// Final phase.
    pub phase: RunPhase,
    /// Operations applied successfully.
    pub applied: usize,
    /// Operations that failed or were skipped.
    #[serde(default)]
    pub not_applied: usize,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
    /// Error message for runs that did not succeed.
    #[serde(default)]
    pub error: Option<String>,
}

impl DeploymentRecord {
    /// Creates an empty record.
    #[must_use]
    pub fn new(cluster: &str, service: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            cluster: cluster.to_string(),
            service: service.to_string(),
            spec_hash: None,
            bindings: Bindings::default(),
            last_phase: None,
            updated_at: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Appends a run, keeping at most [`MAX_HISTORY`] entries.
    ///
    /// A successful deploy or update also becomes the applied spec hash. A
    /// successful teardown clears it.
    pub fn record_run(&mut self, run: RunRecord) {
        if run.phase == RunPhase::Succeeded {
            self.spec_hash = match run.kind {
                RunKind::Teardown => None,
                RunKind::Deploy | RunKind::Update => Some(run.spec_hash.clone()),
            };
        }
        self.last_phase = Some(run.phase);
        self.updated_at = run.finished_at;

        if self.history.len() >= MAX_HISTORY {
            let excess = self.history.len() + 1 - MAX_HISTORY;
            self.history.drain(..excess);
        }
        self.history.push(run);
    }

    /// Returns the most recent run.
    #[must_use]
    pub fn last_run(&self) -> Option<&RunRecord> {
        self.history.last()
    }
}

impl RunRecord {
    /// Starts a record for a run beginning now.
    #[must_use]
    pub fn start(kind: RunKind, spec_hash: &str) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4().to_string(),
            kind,
            spec_hash: spec_hash.to_string(),
            phase: RunPhase::Loading,
            applied: 0,
            not_applied: 0,
            started_at: now,
            finished_at: now,
            error: None,
        }
    }

    /// Marks the run finished in `phase`.
    pub fn finish(&mut self, phase: RunPhase, error: Option<String>) {
        self.phase = phase;
        self.error = error;
        self.finished_at = Utc::now();
    }

    /// Run duration.
    #[must_use]
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished(kind: RunKind, hash: &str, phase: RunPhase) -> RunRecord {
        let mut run = RunRecord::start(kind, hash);
        run.finish(phase, None);
        run
    }

    #[test]
    fn test_successful_deploy_sets_hash() {
        let mut record = DeploymentRecord::new("lamp-cluster", "lamp");
        record.record_run(finished(RunKind::Deploy, "abc", RunPhase::Succeeded));
        record.record_run(finished(RunKind::Update, "def", RunPhase::Failed));

        assert_eq!(record.spec_hash.as_deref(), Some("abc"));
        assert_eq!(record.last_phase, Some(RunPhase::Failed));
        assert_eq!(record.last_run().map(|r| r.spec_hash.as_str()), Some("def"));
    }

    #[test]
    fn test_teardown_clears_hash() {
        let mut record = DeploymentRecord::new("lamp-cluster", "lamp");
        record.record_run(finished(RunKind::Deploy, "abc", RunPhase::Succeeded));
        record.record_run(finished(RunKind::Teardown, "abc", RunPhase::Succeeded));

        assert!(record.spec_hash.is_none());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut record = DeploymentRecord::new("lamp-cluster", "lamp");
        for i in 0..MAX_HISTORY + 5 {
            record.record_run(finished(RunKind::Deploy, &i.to_string(), RunPhase::Succeeded));
        }

        assert_eq!(record.history.len(), MAX_HISTORY);
        assert_eq!(record.history[0].spec_hash, "5");
        assert_eq!(record.spec_hash.as_deref(), Some("104"));
    }
}
