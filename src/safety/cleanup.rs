/// Best-effort cleanup
/// A cleanup is a list of independent steps. Every step is attempted even when
/// an earlier one failed; failures are collected into a report and logged,
/// never propagated.
use crate::config::types::Result;
use log::{debug, info, warn};

type StepFn<'a> = Box<dyn FnOnce() -> Result<()> + 'a>;

/// One named cleanup action
pub struct CleanupStep<'a> {
    name: &'static str,
    action: StepFn<'a>,
}

/// Outcome of a best-effort cleanup run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    /// Step names in execution order
    pub attempted: Vec<&'static str>,
    /// `(step, error message)` for every failed step
    pub failures: Vec<(&'static str, String)>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed_steps(&self) -> Vec<&'static str> {
        self.failures.iter().map(|(name, _)| *name).collect()
    }

    /// Fold another report into this one
    pub fn merge(&mut self, other: CleanupReport) {
        self.attempted.extend(other.attempted);
        self.failures.extend(other.failures);
    }
}

/// Ordered list of cleanup steps executed with per-step error isolation
pub struct CleanupManager<'a> {
    label: String,
    steps: Vec<CleanupStep<'a>>,
}

impl<'a> CleanupManager<'a> {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            steps: Vec::new(),
        }
    }

    /// Append a step; steps run in insertion order
    pub fn step<F>(mut self, name: &'static str, action: F) -> Self
    where
        F: FnOnce() -> Result<()> + 'a,
    {
        self.steps.push(CleanupStep {
            name,
            action: Box::new(action),
        });
        self
    }

    /// Run every step, isolating failures
    pub fn run(self) -> CleanupReport {
        info!("Starting cleanup '{}' ({} steps)", self.label, self.steps.len());

        let mut report = CleanupReport::default();
        for step in self.steps {
            report.attempted.push(step.name);
            match (step.action)() {
                Ok(()) => debug!("Cleanup step '{}' succeeded", step.name),
                Err(e) => {
                    warn!("Cleanup '{}': step '{}' failed: {}", self.label, step.name, e);
                    report.failures.push((step.name, e.to_string()));
                }
            }
        }

        if report.is_clean() {
            info!("Cleanup '{}' complete", self.label);
        } else {
            warn!(
                "Cleanup '{}' finished with {} failed steps: {:?}",
                self.label,
                report.failures.len(),
                report.failed_steps()
            );
        }
        report
    }
}
