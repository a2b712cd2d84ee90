//! Run reports and sinks

use crate::action::{LifecycleAction, LifecyclePlan, Operation, SkippedResource};
use crate::error::Result;
use crate::owner::Owner;
use crate::resource::ResourceType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;

/// What happened to one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    /// The resource was already in the target state, or already gone
    AlreadyDone,
    DryRun,
    Failed,
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceOutcome {
    pub id: String,
    pub resource_type: ResourceType,
    pub action: LifecycleAction,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Run-level exit signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    /// Every stage ran, but at least one action failed or a wait timed out
    CompletedWithFailures,
    /// A terminal stage failed and the rest of the plan was not run
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Succeeded => write!(f, "succeeded"),
            RunStatus::CompletedWithFailures => write!(f, "completed with failures"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Plain record of one plan execution, handed to a [`ReportSink`] untouched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub target_id: String,
    pub owner: Option<Owner>,
    pub operation: Operation,
    pub region: String,
    pub dry_run: bool,
    pub stages_executed: Vec<String>,
    pub acted_on: Vec<ResourceOutcome>,
    pub skipped: Vec<SkippedResource>,
    /// Labels of convergence waits that ran out of attempts
    pub convergence_timeouts: Vec<String>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl RunReport {
    pub fn for_plan(plan: &LifecyclePlan) -> Self {
        Self {
            target_id: plan.target_id.clone(),
            owner: plan.owner.clone(),
            operation: plan.operation,
            region: plan.region.clone(),
            dry_run: plan.dry_run,
            stages_executed: Vec::new(),
            acted_on: Vec::new(),
            skipped: plan.skipped.clone(),
            convergence_timeouts: Vec::new(),
            status: RunStatus::Succeeded,
            started_at: Utc::now(),
            duration_ms: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    pub fn failures(&self) -> Vec<&ResourceOutcome> {
        self.acted_on
            .iter()
            .filter(|o| o.outcome.is_failure())
            .collect()
    }

    pub fn outcome_of(&self, id: &str, action: LifecycleAction) -> Option<Outcome> {
        self.acted_on
            .iter()
            .find(|o| o.id == id && o.action == action)
            .map(|o| o.outcome)
    }

    /// Settle the status once every stage has run or the run aborted
    pub(crate) fn finish(&mut self, aborted: bool, duration_ms: u64) {
        self.duration_ms = duration_ms;
        self.status = if aborted {
            RunStatus::Failed
        } else if !self.failures().is_empty() || !self.convergence_timeouts.is_empty() {
            RunStatus::CompletedWithFailures
        } else {
            RunStatus::Succeeded
        };
    }
}

/// External reporter (file, spreadsheet, log)
pub trait ReportSink {
    fn publish(&mut self, report: &RunReport) -> Result<()>;
}

/// Writes each report as pretty JSON followed by a newline
pub struct JsonReportSink<W: Write> {
    writer: W,
}

impl<W: Write> JsonReportSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> ReportSink for JsonReportSink<W> {
    fn publish(&mut self, report: &RunReport) -> Result<()> {
        serde_json::to_writer_pretty(&mut self.writer, report)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}
