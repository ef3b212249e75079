use crate::alert::{Alert, AlertsSummary};
use crate::config::{Config, OutputConfig};
use crate::finding::{value_to_string, Record};
use crate::step::StepReport;
use comfy_table::{presets::ASCII_FULL, Table};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("failed to write report {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
    #[error("failed to serialise report: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Everything an output renderer gets to see about a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub config: String,
    pub started: String,
    pub finished: String,
    pub summary: AlertsSummary,
    /// Most severe first.
    pub alerts: Vec<Alert>,
    pub steps: Vec<StepReport>,
}

pub fn write_outputs(config: &Config, report: &RunReport) -> Result<Vec<PathBuf>, OutputError> {
    let mut written = Vec::new();
    for output in &config.outputs {
        let path = config.resolve_output_path(output);
        let contents = match output {
            OutputConfig::Markdown { .. } => render_markdown(report),
            OutputConfig::Json { .. } => render_json(report)?,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| OutputError::Write {
                path: path.clone(),
                source,
            })?;
        }
        fs::write(&path, contents).map_err(|source| OutputError::Write {
            path: path.clone(),
            source,
        })?;
        info!(path = %path.display(), "report written");
        written.push(path);
    }
    Ok(written)
}

pub fn render_json(report: &RunReport) -> Result<String, OutputError> {
    Ok(serde_json::to_string_pretty(report)?)
}

pub fn render_markdown(report: &RunReport) -> String {
    let mut md = String::new();
    md.push_str("# yesses Report\n\n");
    md.push_str(&format!("**Configuration:** {}\n\n", report.config));
    md.push_str(&format!(
        "_Run started at {}, finished at {}_\n\n",
        report.started, report.finished
    ));

    md.push_str("## Summary\n\n");
    let rows: Vec<Vec<String>> = report
        .summary
        .rows
        .iter()
        .map(|row| {
            vec![
                row.severity.to_string(),
                row.alerts.to_string(),
                row.findings.to_string(),
            ]
        })
        .collect();
    md.push_str(&render_markdown_table(&["Severity", "Alerts", "Findings"], &rows));
    md.push('\n');
    match report.summary.max_severity {
        Some(severity) => md.push_str(&format!("**Highest severity:** {severity}\n\n")),
        None => md.push_str("No alerts were raised.\n\n"),
    }

    if !report.alerts.is_empty() {
        md.push_str("## Alerts\n\n");
        for alert in &report.alerts {
            md.push_str(&format!("### [{}] {}\n\n", alert.severity, alert.step));
            md.push_str(&format!(
                "Violated rule: `{}`\n\n",
                sanitize_markdown_cell(&alert.violated_rule)
            ));
            for (label, records) in &alert.findings {
                md.push_str(&format!("**{label}**\n\n"));
                md.push_str(&render_records(records));
                md.push('\n');
            }
        }
    }

    md.push_str("## Steps\n\n");
    let rows: Vec<Vec<String>> = report
        .steps
        .iter()
        .map(|step| {
            vec![
                step.number.to_string(),
                step.name.clone(),
                step.action.clone(),
                if step.executed { "yes" } else { "skipped" }.to_string(),
                format!("{:.3}", step.duration_secs),
            ]
        })
        .collect();
    md.push_str(&render_markdown_table(
        &["#", "Name", "Action", "Executed", "Duration (s)"],
        &rows,
    ));
    md
}

/// Per-severity counts for the console.
pub fn summary_table(summary: &AlertsSummary) -> String {
    let mut display = Table::new();
    display.load_preset(ASCII_FULL);
    display.set_header(vec!["Severity", "Alerts", "Findings"]);
    for row in &summary.rows {
        display.add_row(vec![
            row.severity.to_string(),
            row.alerts.to_string(),
            row.findings.to_string(),
        ]);
    }
    display.to_string()
}

pub fn steps_table(steps: &[StepReport]) -> String {
    let mut display = Table::new();
    display.load_preset(ASCII_FULL);
    display.set_header(vec!["#", "Name", "Action", "Executed", "Duration (s)"]);
    for step in steps {
        display.add_row(vec![
            step.number.to_string(),
            step.name.clone(),
            step.action.clone(),
            if step.executed { "yes" } else { "skipped" }.to_string(),
            format!("{:.3}", step.duration_secs),
        ]);
    }
    display.to_string()
}

fn render_records(records: &[Record]) -> String {
    let columns: BTreeSet<&str> = records
        .iter()
        .flat_map(|record| record.keys().map(String::as_str))
        .collect();
    let columns: Vec<&str> = columns.into_iter().collect();
    let rows: Vec<Vec<String>> = records
        .iter()
        .map(|record| {
            columns
                .iter()
                .map(|column| value_to_string(record.get(*column)))
                .collect()
        })
        .collect();
    render_markdown_table(&columns, &rows)
}

fn render_markdown_table(columns: &[&str], rows: &[Vec<String>]) -> String {
    let mut md = String::new();
    md.push('|');
    for column in columns {
        md.push(' ');
        md.push_str(&sanitize_markdown_cell(column));
        md.push_str(" |");
    }
    md.push('\n');

    md.push('|');
    for _ in columns {
        md.push_str(" --- |");
    }
    md.push('\n');

    for row in rows {
        md.push('|');
        for value in row {
            md.push(' ');
            md.push_str(&sanitize_markdown_cell(value));
            md.push_str(" |");
        }
        md.push('\n');
    }

    md
}

fn sanitize_markdown_cell(value: &str) -> String {
    let replaced = value.replace('\n', "<br>");
    replaced.replace('|', "\\|")
}
