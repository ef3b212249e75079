use crate::alert::StepRef;
use crate::expression::ParseError;
use crate::output::OutputError;
use crate::state::StateError;
use crate::step::StepError;
use crate::validation::Diagnostic;
use std::io;
use std::path::PathBuf;

/// Problems found while loading a configuration document, before anything runs.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("configuration {} is not valid YAML: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("initial data '{key}' must be a list of mappings")]
    InvalidData { key: String },
    #[error("Step #{number}: step definition must be a mapping")]
    InvalidStep { number: usize },
    #[error("Step #{number}: no action found")]
    NoAction { number: usize },
    #[error("Step #{number}: more than one action found: {}", actions.join(", "))]
    MultipleActions { number: usize, actions: Vec<String> },
    #[error("Step #{number}: unknown action '{action}' (available: {})", available.join(", "))]
    UnknownModule {
        number: usize,
        action: String,
        available: Vec<String>,
    },
    #[error("{step}: parameters must be a mapping")]
    InvalidParameters { step: StepRef },
    #[error("{step}: missing keyword 'find'")]
    MissingFind { step: StepRef },
    #[error("{step}: '{keyword}' must be a string or a list of strings")]
    InvalidKeyword { step: StepRef, keyword: String },
    #[error("{step}: {source}")]
    Expression { step: StepRef, source: ParseError },
    #[error("{step}: module does not declare output '{output}' (declared: {})", declared.join(", "))]
    UnknownOutput {
        step: StepRef,
        output: String,
        declared: Vec<String>,
    },
    #[error("output entry {index} is invalid: {reason}")]
    InvalidOutput { index: usize, reason: String },
    #[error("pipeline validation failed:\n{}", render_diagnostics(.0))]
    Validation(Vec<Diagnostic>),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Step(#[from] StepError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Output(#[from] OutputError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

fn render_diagnostics(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .iter()
        .map(|diagnostic| format!("  {diagnostic}"))
        .collect::<Vec<_>>()
        .join("\n")
}
