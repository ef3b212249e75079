//! Sequential pipeline execution with resume and repeat support.
//!
//! After every executed step both the findings registry and the alerts list
//! are snapshotted under the step number. `--resume` restores the latest
//! snapshot and continues after it; `--repeat N` restores an earlier one and
//! runs the last N completed steps again.

use crate::alert::{now_rfc3339, AlertsList, Severity};
use crate::config::Config;
use crate::error::Result;
use crate::module::ModuleRegistry;
use crate::output::{write_outputs, RunReport};
use crate::registry::FindingsRegistry;
use crate::state::StateError;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Continue after the last step recorded in the resume stores.
    pub resume: bool,
    /// Re-run this many already completed steps.
    pub repeat: Option<usize>,
    /// Ignore persisted baseline and resume data.
    pub fresh: bool,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub report: RunReport,
    pub written: Vec<PathBuf>,
}

impl RunOutcome {
    pub fn has_alert_at_least(&self, threshold: Severity) -> bool {
        self.report
            .alerts
            .iter()
            .any(|alert| alert.severity >= threshold)
    }
}

pub struct Runner<'a> {
    config: Config,
    modules: &'a ModuleRegistry,
    findings: FindingsRegistry,
    alerts: AlertsList,
    options: RunOptions,
}

impl<'a> Runner<'a> {
    pub fn new(
        config: Config,
        modules: &'a ModuleRegistry,
        options: RunOptions,
    ) -> std::result::Result<Self, StateError> {
        let paths = config.state_paths();
        let findings = FindingsRegistry::new(
            &paths.persist,
            &paths.resume,
            config.initial.clone(),
            options.fresh,
        )?;
        let alerts = AlertsList::new(&paths.alerts, options.fresh)?;
        Ok(Self {
            config,
            modules,
            findings,
            alerts,
            options,
        })
    }

    pub fn findings(&self) -> &FindingsRegistry {
        &self.findings
    }

    /// Restores registry and alerts, returning the highest step number whose
    /// effects are already contained in the restored state (`None` for a
    /// run from scratch).
    pub fn prepare(&mut self) -> std::result::Result<Option<usize>, StateError> {
        let total = self.config.steps.len();
        let resumed = if self.options.resume {
            Some(self.load_resume(None)?)
        } else {
            None
        };

        let Some(repeat) = self.options.repeat else {
            if let Some(step) = resumed {
                info!(step, "resuming after step");
                // steps after the restored snapshot run for the first time
                self.findings.set_replay(false);
            }
            return Ok(resumed);
        };

        let skip_to = repeat_window(total, resumed, repeat)?;
        info!(skip_to, repeat, "repeating steps after snapshot");
        self.load_resume(Some(skip_to))?;
        Ok(Some(skip_to))
    }

    pub fn run(mut self) -> Result<RunOutcome> {
        let skip_to = self.prepare()?;

        for step in self.config.steps.iter_mut() {
            let number = step.number();
            if skip_to.is_some_and(|skip| number <= skip) {
                info!(step = number, action = step.action(), "skipping step, restored from resume data");
                continue;
            }

            info!(step = number, action = step.action(), name = step.name(), "running step");
            step.load_findings(&self.findings)?;
            let alerts = step.execute(&mut self.findings, self.modules)?;
            for alert in &alerts {
                warn!(
                    step = number,
                    severity = %alert.severity,
                    findings = alert.finding_count(),
                    "violated rule '{}'",
                    alert.violated_rule
                );
            }
            self.alerts.collect(alerts);
            self.findings.save_resume(number)?;
            self.alerts.save_resume(number)?;
        }

        self.findings.save_persist()?;

        let report = RunReport {
            config: self.config.path.display().to_string(),
            started: self.alerts.started().to_string(),
            finished: now_rfc3339(),
            summary: self.alerts.summary(),
            alerts: self.alerts.sorted().into_iter().cloned().collect(),
            steps: self.config.steps.iter().map(|step| step.report()).collect(),
        };
        let written = write_outputs(&self.config, &report)?;
        info!(
            alerts = report.alerts.len(),
            max_severity = ?report.summary.max_severity,
            "run finished"
        );
        Ok(RunOutcome { report, written })
    }

    /// Loads both resume stores, insisting that they stopped at the same step.
    fn load_resume(&mut self, step: Option<usize>) -> std::result::Result<usize, StateError> {
        let findings_step = self.findings.load_resume(step)?;
        match self.alerts.load_resume(step) {
            Ok(alerts_step) if alerts_step != findings_step => Err(StateError::Inconsistent {
                findings_step,
                alerts_step,
            }),
            Ok(_) => Ok(findings_step),
            Err(StateError::NoResumeData { path }) if step.is_none() => {
                warn!(path = %path.display(), "no alerts resume data, continuing without earlier alerts");
                Ok(findings_step)
            }
            Err(err) => Err(err),
        }
    }
}

/// Step number whose snapshot a `--repeat` run restores. Without a resume the
/// window ends at the last step of the pipeline.
pub fn repeat_window(
    total: usize,
    resumed: Option<usize>,
    repeat: usize,
) -> std::result::Result<usize, StateError> {
    let last_done = match resumed {
        Some(step) => step as i64,
        None => total as i64 - 1,
    };
    let skip_to = last_done - repeat as i64;
    usize::try_from(skip_to).map_err(|_| StateError::NotEnoughSteps {
        total,
        repeat,
        skip_to,
    })
}
