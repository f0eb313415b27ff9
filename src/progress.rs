//! Structured progress events.
//!
//! A run reports phase transitions, per-operation outcomes and convergence
//! polls through a [`ProgressReporter`]. The CLI prints them as colored text
//! or as one JSON object per line.

use chrono::{DateTime, Utc};
use colored::Colorize;
use serde::Serialize;
use std::io::Write;
use std::sync::Mutex;

use crate::reconciler::RunPhase;

/// Outcome of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// The operation started.
    Started,
    /// The operation completed.
    Succeeded,
    /// The operation failed permanently.
    Failed,
    /// The operation never ran.
    Skipped,
}

/// A single progress event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// The run entered a new phase.
    Phase {
        /// Cluster/service the run targets.
        target: String,
        /// New phase.
        phase: RunPhase,
        /// When the transition happened.
        at: DateTime<Utc>,
    },
    /// An operation changed status.
    Operation {
        /// Plan index.
        index: usize,
        /// Operation description.
        description: String,
        /// New status.
        status: OperationStatus,
        /// Error or skip reason.
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    /// A convergence poll completed.
    Poll {
        /// Desired task count.
        desired: u32,
        /// Running task count.
        running: u32,
        /// Pending task count.
        pending: u32,
        /// Healthy target count.
        healthy: u32,
    },
}

/// Sink for progress events.
pub trait ProgressReporter: Send + Sync {
    /// Reports one event.
    fn report(&self, event: &ProgressEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn report(&self, _event: &ProgressEvent) {}
}

/// Writes one JSON object per line.
#[derive(Debug)]
pub struct JsonProgress<W: Write + Send> {
    out: Mutex<W>,
}

impl JsonProgress<std::io::Stdout> {
    /// Writes to standard output.
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> JsonProgress<W> {
    /// Writes to `out`.
    pub const fn new(out: W) -> Self {
        Self { out: Mutex::new(out) }
    }
}

impl<W: Write + Send> ProgressReporter for JsonProgress<W> {
    fn report(&self, event: &ProgressEvent) {
        let Ok(line) = serde_json::to_string(event) else {
            return;
        };
        if let Ok(mut out) = self.out.lock() {
            // a closed pipe must not abort the run
            let _ = writeln!(out, "{line}");
            let _ = out.flush();
        }
    }
}

/// Human-readable progress on standard error.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextProgress;

impl ProgressReporter for TextProgress {
    fn report(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Phase { target, phase, .. } => {
                eprintln!("{} {} {}", "==>".blue().bold(), target.bold(), phase);
            }
            ProgressEvent::Operation {
                description,
                status,
                detail,
                ..
            } => {
                let mark = match status {
                    OperationStatus::Started => "...".dimmed(),
                    OperationStatus::Succeeded => "ok".green(),
                    OperationStatus::Failed => "failed".red().bold(),
                    OperationStatus::Skipped => "skipped".yellow(),
                };
                match detail {
                    Some(detail) => eprintln!("  {mark} {description}: {}", detail.dimmed()),
                    None => eprintln!("  {mark} {description}"),
                }
            }
            ProgressEvent::Poll {
                desired,
                running,
                pending,
                healthy,
            } => {
                eprintln!(
                    "  {} running {running}/{desired}, pending {pending}, healthy {healthy}",
                    "~".cyan()
                );
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::{ProgressEvent, ProgressReporter};
    use std::sync::Mutex;

    /// Collects events for assertions.
    #[derive(Debug, Default)]
    pub struct RecordingProgress {
        pub events: Mutex<Vec<ProgressEvent>>,
    }

    impl RecordingProgress {
        pub fn events(&self) -> Vec<ProgressEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl ProgressReporter for RecordingProgress {
        fn report(&self, event: &ProgressEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_lines() {
        let progress = JsonProgress::new(Vec::new());
        progress.report(&ProgressEvent::Operation {
            index: 3,
            description: String::from("create listener lamp-alb:80"),
            status: OperationStatus::Succeeded,
            detail: None,
        });
        progress.report(&ProgressEvent::Poll {
            desired: 2,
            running: 1,
            pending: 1,
            healthy: 1,
        });

        let out = progress.out.into_inner().unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "operation");
        assert_eq!(first["status"], "succeeded");
        assert!(first.get("detail").is_none());
    }
}
