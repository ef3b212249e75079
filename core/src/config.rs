use crate::error::ConfigError;
use crate::finding::Record;
use crate::module::ModuleRegistry;
use crate::state::FindingsMap;
use crate::step::Step;
use crate::validation::{validate_pipeline, Diagnostic};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
struct ConfigDocument {
    #[serde(default)]
    data: BTreeMap<String, Value>,
    #[serde(default)]
    run: Vec<Value>,
    #[serde(default)]
    output: Vec<Value>,
}

/// Report writers selected by the `output` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", deny_unknown_fields)]
pub enum OutputConfig {
    Markdown { filename: PathBuf },
    Json { filename: PathBuf },
}

impl OutputConfig {
    pub fn filename(&self) -> &Path {
        match self {
            OutputConfig::Markdown { filename } | OutputConfig::Json { filename } => filename,
        }
    }
}

/// Files holding the state of one configuration between runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    pub persist: PathBuf,
    pub resume: PathBuf,
    pub alerts: PathBuf,
}

impl StatePaths {
    pub fn for_config(path: &Path) -> Self {
        let with_suffix = |suffix: &str| {
            let mut name = path.as_os_str().to_os_string();
            name.push(suffix);
            PathBuf::from(name)
        };
        Self {
            persist: with_suffix(".state"),
            resume: with_suffix(".resume"),
            alerts: with_suffix(".alerts"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub path: PathBuf,
    pub initial: FindingsMap,
    pub steps: Vec<Step>,
    pub outputs: Vec<OutputConfig>,
    /// Non-fatal findings of the pipeline validator.
    pub warnings: Vec<Diagnostic>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>, modules: &ModuleRegistry) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path, modules)
    }

    /// Parses and validates a configuration; `path` locates state files and
    /// relative output filenames.
    pub fn parse(text: &str, path: &Path, modules: &ModuleRegistry) -> Result<Self, ConfigError> {
        let document: ConfigDocument =
            serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        let initial = document
            .data
            .into_iter()
            .map(|(key, value)| records_from_data(&key, value).map(|records| (key, records)))
            .collect::<Result<FindingsMap, _>>()?;

        let steps = document
            .run
            .into_iter()
            .enumerate()
            .map(|(number, definition)| Step::from_config(number, definition, modules))
            .collect::<Result<Vec<_>, _>>()?;

        let outputs = document
            .output
            .into_iter()
            .enumerate()
            .map(|(index, value)| {
                serde_json::from_value(value).map_err(|err| ConfigError::InvalidOutput {
                    index,
                    reason: err.to_string(),
                })
            })
            .collect::<Result<Vec<OutputConfig>, _>>()?;

        let (errors, warnings): (Vec<_>, Vec<_>) = validate_pipeline(&initial, &steps)
            .into_iter()
            .partition(Diagnostic::is_error);
        for warning in &warnings {
            warn!("{warning}");
        }
        if !errors.is_empty() {
            return Err(ConfigError::Validation(errors));
        }

        info!(
            path = %path.display(),
            steps = steps.len(),
            keys = initial.len(),
            "configuration loaded"
        );
        Ok(Self {
            path: path.to_path_buf(),
            initial,
            steps,
            outputs,
            warnings,
        })
    }

    pub fn state_paths(&self) -> StatePaths {
        StatePaths::for_config(&self.path)
    }

    /// Output filenames are relative to the configuration's directory.
    pub fn resolve_output_path(&self, output: &OutputConfig) -> PathBuf {
        let filename = output.filename();
        if filename.is_absolute() {
            return filename.to_path_buf();
        }
        match self.path.parent() {
            Some(dir) => dir.join(filename),
            None => filename.to_path_buf(),
        }
    }
}

fn records_from_data(key: &str, value: Value) -> Result<Vec<Record>, ConfigError> {
    let invalid = || ConfigError::InvalidData {
        key: key.to_string(),
    };
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(map) => Ok(map.into_iter().collect()),
                _ => Err(invalid()),
            })
            .collect(),
        _ => Err(invalid()),
    }
}
