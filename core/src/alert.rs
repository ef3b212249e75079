use crate::expression::ParseError;
use crate::finding::Record;
use crate::state::{AlertsResumeState, StateError, StateFile};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Informative,
    Medium,
    High,
    VeryHigh,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Informative,
        Severity::Medium,
        Severity::High,
        Severity::VeryHigh,
    ];

    /// Maps "very high", "Very_High", "HIGH", ... onto the enum.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let normalized = text
            .split_whitespace()
            .collect::<Vec<_>>()
            .join("_")
            .to_ascii_uppercase();
        match normalized.as_str() {
            "INFORMATIVE" => Ok(Severity::Informative),
            "MEDIUM" => Ok(Severity::Medium),
            "HIGH" => Ok(Severity::High),
            "VERY_HIGH" => Ok(Severity::VeryHigh),
            _ => Err(ParseError::UnknownSeverity(text.trim().to_string())),
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Severity::Informative => "INFORMATIVE",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::VeryHigh => "VERY_HIGH",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Severity::parse(s)
    }
}

/// Identifies the step an alert or error belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRef {
    pub number: usize,
    pub action: String,
    pub name: String,
}

impl fmt::Display for StepRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Step #{} ({})", self.number, self.action)
    }
}

/// Labelled record lists attached to an alert, e.g. `missing items`.
pub type AlertPayload = BTreeMap<String, Vec<Record>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub violated_rule: String,
    pub findings: AlertPayload,
    pub step: StepRef,
    pub severity: Severity,
}

impl Alert {
    pub fn finding_count(&self) -> usize {
        self.findings.values().map(Vec::len).sum()
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "[{}] {}: violated rule '{}'",
            self.severity, self.step, self.violated_rule
        )?;
        for (label, records) in &self.findings {
            writeln!(f, "  {label}:")?;
            for record in records {
                let rendered = serde_json::to_string(record).unwrap_or_default();
                writeln!(f, "    - {rendered}")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeveritySummary {
    pub severity: Severity,
    pub alerts: usize,
    pub findings: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsSummary {
    /// Most severe first.
    pub rows: Vec<SeveritySummary>,
    pub max_severity: Option<Severity>,
}

#[derive(Debug)]
pub struct AlertsList {
    alerts: Vec<Alert>,
    started: String,
    resume: StateFile<AlertsResumeState>,
}

impl AlertsList {
    pub fn new(resume_path: impl Into<PathBuf>, fresh: bool) -> Result<Self, StateError> {
        Ok(Self {
            alerts: Vec::new(),
            started: now_rfc3339(),
            resume: StateFile::open(resume_path, fresh)?,
        })
    }

    pub fn collect(&mut self, alerts: impl IntoIterator<Item = Alert>) {
        self.alerts.extend(alerts);
    }

    pub fn alerts(&self) -> &[Alert] {
        &self.alerts
    }

    pub fn started(&self) -> &str {
        &self.started
    }

    pub fn save_resume(&mut self, step: usize) -> Result<(), StateError> {
        let data = self.resume.data_mut();
        data.snapshots.insert(step, self.alerts.clone());
        data.last_step = Some(step);
        data.started = Some(self.started.clone());
        self.resume.save()
    }

    /// Restores the alerts collected up to and including `step` (or the
    /// latest recorded step) and returns the step number that was restored.
    pub fn load_resume(&mut self, step: Option<usize>) -> Result<usize, StateError> {
        self.resume.reload()?;
        let data = self.resume.data();
        let step = match step {
            Some(step) => step,
            None => data.last_step.ok_or_else(|| StateError::NoResumeData {
                path: self.resume.path().to_path_buf(),
            })?,
        };
        let alerts = data
            .snapshots
            .get(&step)
            .cloned()
            .ok_or(StateError::MissingSnapshot { step })?;
        if let Some(started) = data.started.clone() {
            self.started = started;
        }
        self.alerts = alerts;
        Ok(step)
    }

    /// Alerts ordered from most to least severe; ties keep collection order.
    pub fn sorted(&self) -> Vec<&Alert> {
        let mut sorted: Vec<&Alert> = self.alerts.iter().collect();
        sorted.sort_by(|a, b| b.severity.cmp(&a.severity));
        sorted
    }

    pub fn summary(&self) -> AlertsSummary {
        let mut rows = Vec::new();
        let mut max_severity = None;
        for severity in Severity::ALL.iter().rev().copied() {
            let relevant: Vec<&Alert> = self
                .alerts
                .iter()
                .filter(|alert| alert.severity == severity)
                .collect();
            if !relevant.is_empty() && max_severity.is_none() {
                max_severity = Some(severity);
            }
            rows.push(SeveritySummary {
                severity,
                alerts: relevant.len(),
                findings: relevant.iter().map(|alert| alert.finding_count()).sum(),
            });
        }
        AlertsSummary { rows, max_severity }
    }
}

pub(crate) fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown".to_string())
}
