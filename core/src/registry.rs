use crate::expression::{InputValue, UseExpr};
use crate::finding::{self, Comparison, NoCommonAttributes, Record};
use crate::state::{FindingsMap, ResumeState, StateError, StateFile};
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown findings key: {key}; existing keys are: {}", known.join(", "))]
    UnknownKey { key: String, known: Vec<String> },
    #[error("storing findings in key {key} would overwrite existing findings")]
    DuplicateKey { key: String },
    #[error("cannot compare {left_key} with {right_key}: {source}")]
    NoCommonAttributes {
        left_key: String,
        right_key: String,
        source: NoCommonAttributes,
    },
}

/// Named finding lists of the running pipeline (`current`) next to the
/// baseline of the last completed run (`previous`).
#[derive(Debug)]
pub struct FindingsRegistry {
    current: FindingsMap,
    previous: FindingsMap,
    persist: StateFile<FindingsMap>,
    resume: StateFile<ResumeState>,
    replay: bool,
}

impl FindingsRegistry {
    pub fn new(
        persist_path: impl Into<PathBuf>,
        resume_path: impl Into<PathBuf>,
        initial: FindingsMap,
        fresh: bool,
    ) -> Result<Self, StateError> {
        let persist: StateFile<FindingsMap> = StateFile::open(persist_path, fresh)?;
        let resume = StateFile::open(resume_path, fresh)?;
        let previous = persist.data().clone();
        Ok(Self {
            current: initial,
            previous,
            persist,
            resume,
            replay: false,
        })
    }

    pub fn get(&self, key: &str) -> Result<&[Record], RegistryError> {
        self.current
            .get(key)
            .map(Vec::as_slice)
            .ok_or_else(|| RegistryError::UnknownKey {
                key: key.to_string(),
                known: self.current.keys().cloned().collect(),
            })
    }

    /// Records of `key`, each reduced to the named attributes.
    pub fn get_attributes(
        &self,
        key: &str,
        attributes: &[&str],
    ) -> Result<Vec<Record>, RegistryError> {
        let wanted: BTreeSet<String> = attributes.iter().map(|name| name.to_string()).collect();
        Ok(finding::project_all(self.get(key)?, &wanted))
    }

    /// Write-once store; overwriting is only tolerated in replay mode.
    pub fn set(&mut self, key: impl Into<String>, value: Vec<Record>) -> Result<(), RegistryError> {
        let key = key.into();
        if !self.replay && self.current.contains_key(&key) {
            return Err(RegistryError::DuplicateKey { key });
        }
        debug!(key = %key, records = value.len(), "storing findings");
        self.current.insert(key, value);
        Ok(())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.current.contains_key(key)
    }

    pub fn get_previous<'a>(&'a self, key: &str, default: &'a [Record]) -> &'a [Record] {
        self.previous
            .get(key)
            .map(Vec::as_slice)
            .unwrap_or(default)
    }

    /// Current records of `key` that the previous run did not report.
    pub fn get_added_items(&self, key: &str) -> Result<Vec<Record>, RegistryError> {
        let current = self.get(key)?;
        let previous = self.get_previous(key, &[]);
        Ok(finding::difference(current, previous))
    }

    pub fn get_common_and_missing_items(
        &self,
        left_key: &str,
        right_key: &str,
    ) -> Result<Comparison, RegistryError> {
        let left = self.get(left_key)?;
        let right = self.get(right_key)?;
        finding::compare(left, right).map_err(|source| RegistryError::NoCommonAttributes {
            left_key: left_key.to_string(),
            right_key: right_key.to_string(),
            source,
        })
    }

    /// Merges the referenced lists, dropping repeated records while keeping
    /// first-seen order.
    pub fn resolve_use(&self, expr: &UseExpr) -> Result<Vec<Record>, RegistryError> {
        let mut merged = Vec::new();
        for key in &expr.keys {
            finding::extend_unique(&mut merged, self.get(key)?);
        }
        Ok(merged)
    }

    pub fn resolve_input(&self, input: &InputValue) -> Result<Value, RegistryError> {
        match input {
            InputValue::Literal(value) => Ok(value.clone()),
            InputValue::Reference(expr) => {
                let records = self.resolve_use(expr)?;
                Ok(Value::Array(
                    records
                        .into_iter()
                        .map(|record| Value::Object(record.into_iter().collect()))
                        .collect(),
                ))
            }
        }
    }

    pub fn save_persist(&mut self) -> Result<(), StateError> {
        self.persist.replace(self.current.clone());
        self.persist.save()
    }

    pub fn save_resume(&mut self, step: usize) -> Result<(), StateError> {
        let data = self.resume.data_mut();
        data.snapshots.insert(step, self.current.clone());
        data.last_step = Some(step);
        self.resume.save()
    }

    /// Replaces `current` wholesale with the snapshot taken after `step`
    /// (default: the latest one) and enters replay mode.
    pub fn load_resume(&mut self, step: Option<usize>) -> Result<usize, StateError> {
        self.resume.reload()?;
        let data = self.resume.data();
        let step = match step {
            Some(step) => step,
            None => data.last_step.ok_or_else(|| StateError::NoResumeData {
                path: self.resume.path().to_path_buf(),
            })?,
        };
        debug!(step, "loading findings resume data");
        let snapshot = data
            .snapshots
            .get(&step)
            .cloned()
            .ok_or(StateError::MissingSnapshot { step })?;
        self.current = snapshot;
        self.replay = true;
        Ok(step)
    }

    pub fn set_replay(&mut self, replay: bool) {
        self.replay = replay;
    }

    pub fn is_replay(&self) -> bool {
        self.replay
    }

    pub fn current(&self) -> &FindingsMap {
        &self.current
    }
}
