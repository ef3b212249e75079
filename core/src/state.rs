use crate::alert::Alert;
use crate::finding::Record;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Finding key -> records, the shape of one registry generation.
pub type FindingsMap = BTreeMap<String, Vec<Record>>;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("failed to read state file {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to write state file {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
    #[error("state file {} is not valid: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("failed to serialise state for {}: {source}", path.display())]
    Serialize {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("no resume data recorded in {}", path.display())]
    NoResumeData { path: PathBuf },
    #[error("no resume snapshot recorded for step {step}")]
    MissingSnapshot { step: usize },
    #[error(
        "inconsistent file state: findings list is in step {findings_step}, alerts list is in step {alerts_step}; cannot resume/repeat"
    )]
    Inconsistent {
        findings_step: usize,
        alerts_step: usize,
    },
    #[error(
        "there are {total} steps, repeating {repeat} would resume from step {skip_to}; that does not work"
    )]
    NotEnoughSteps {
        total: usize,
        repeat: usize,
        skip_to: i64,
    },
}

/// Snapshots of the full `current` registry, keyed by the step after which
/// they were taken.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResumeState {
    #[serde(default)]
    pub last_step: Option<usize>,
    #[serde(default)]
    pub snapshots: BTreeMap<usize, FindingsMap>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertsResumeState {
    #[serde(default)]
    pub last_step: Option<usize>,
    #[serde(default)]
    pub started: Option<String>,
    #[serde(default)]
    pub snapshots: BTreeMap<usize, Vec<Alert>>,
}

/// A YAML document on disk mirrored by an in-memory value.
#[derive(Debug)]
pub struct StateFile<T> {
    path: PathBuf,
    data: T,
    fresh: bool,
}

impl<T> StateFile<T>
where
    T: Default + Serialize + DeserializeOwned,
{
    /// Opens the state file; `fresh` ignores whatever is stored on disk.
    pub fn open(path: impl Into<PathBuf>, fresh: bool) -> Result<Self, StateError> {
        let path = path.into();
        let data = if fresh { T::default() } else { read_state(&path)? };
        Ok(Self { path, data, fresh })
    }

    /// Re-reads the file. A fresh state file never reads what an earlier run
    /// left on disk and keeps its in-memory value instead.
    pub fn reload(&mut self) -> Result<(), StateError> {
        if self.fresh {
            return Ok(());
        }
        self.data = read_state(&self.path)?;
        Ok(())
    }

    pub fn save(&self) -> Result<(), StateError> {
        let text = serde_yaml::to_string(&self.data).map_err(|source| StateError::Serialize {
            path: self.path.clone(),
            source,
        })?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, text)
            .and_then(|_| fs::rename(&tmp, &self.path))
            .map_err(|source| StateError::Write {
                path: self.path.clone(),
                source,
            })?;
        debug!(path = %self.path.display(), "state saved");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut T {
        &mut self.data
    }

    pub fn replace(&mut self, data: T) {
        self.data = data;
    }
}

fn read_state<T>(path: &Path) -> Result<T, StateError>
where
    T: Default + DeserializeOwned,
{
    if !path.exists() {
        return Ok(T::default());
    }
    let text = fs::read_to_string(path).map_err(|source| StateError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    if text.trim().is_empty() {
        return Ok(T::default());
    }
    serde_yaml::from_str(&text).map_err(|source| StateError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
