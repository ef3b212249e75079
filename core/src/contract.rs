//! Declared inputs/outputs of a module and the checks that keep every step's
//! data flow down to typed record lists.

use crate::alert::StepRef;
use crate::finding::Record;
use globset::Glob;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Output name -> records, as produced by one module run.
pub type ModuleResults = BTreeMap<String, Vec<Record>>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ContractError {
    #[error("{step}: missing required input '{input}'")]
    MissingInput { step: StepRef, input: String },
    #[error("{step}: unknown input '{input}' (module accepts: {})", accepted.join(", "))]
    UnexpectedInput {
        step: StepRef,
        input: String,
        accepted: Vec<String>,
    },
    #[error("{step}: input '{input}' must be a list of records")]
    NotARecordList { step: StepRef, input: String },
    #[error("{step}: missing key '{key}' on input element {element} of '{input}'")]
    MissingKey {
        step: StepRef,
        input: String,
        key: String,
        element: String,
    },
    #[error("{module}: input '{input}' is unwrapped and must declare exactly one required key")]
    InvalidUnwrap { module: String, input: String },
    #[error("{step}: module produced undeclared output '{output}'")]
    UnexpectedOutput { step: StepRef, output: String },
    #[error("{step}: module did not produce declared output '{output}'")]
    MissingOutput { step: StepRef, output: String },
    #[error("{step}: missing key '{key}' on record {record} of output '{output}'")]
    MissingOutputKey {
        step: StepRef,
        output: String,
        key: String,
        record: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSpec {
    pub name: String,
    /// `None` for scalar or opaque inputs.
    pub required_keys: Option<Vec<String>>,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub unwrap: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    /// Exact output name or a wildcard pattern such as `*-IPs`.
    pub name: String,
    pub required_keys: Option<Vec<String>>,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleSpec {
    pub verb: String,
    pub subject: String,
    pub description: String,
    pub inputs: Vec<InputSpec>,
    pub outputs: Vec<OutputSpec>,
}

impl InputSpec {
    pub fn scalar(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            required_keys: None,
            description: description.to_string(),
            default: None,
            unwrap: false,
        }
    }

    pub fn records(name: &str, keys: &[&str], description: &str) -> Self {
        Self {
            required_keys: Some(keys.iter().map(|key| key.to_string()).collect()),
            ..Self::scalar(name, description)
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn unwrapped(mut self) -> Self {
        self.unwrap = true;
        self
    }
}

impl OutputSpec {
    pub fn records(name: &str, keys: &[&str], description: &str) -> Self {
        Self {
            name: name.to_string(),
            required_keys: Some(keys.iter().map(|key| key.to_string()).collect()),
            description: description.to_string(),
        }
    }

    pub fn is_pattern(&self) -> bool {
        self.name.contains(['*', '?', '['])
    }

    pub fn matches(&self, output: &str) -> bool {
        if !self.is_pattern() {
            return self.name == output;
        }
        Glob::new(&self.name)
            .map(|glob| glob.compile_matcher().is_match(output))
            .unwrap_or(false)
    }
}

impl ModuleSpec {
    pub fn new(verb: &str, subject: &str, description: &str) -> Self {
        Self {
            verb: verb.to_string(),
            subject: subject.to_string(),
            description: description.to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn input(mut self, spec: InputSpec) -> Self {
        self.inputs.push(spec);
        self
    }

    pub fn output(mut self, spec: OutputSpec) -> Self {
        self.outputs.push(spec);
        self
    }

    pub fn action(&self) -> String {
        format!("{} {}", self.verb, self.subject)
    }

    pub fn find_input(&self, name: &str) -> Option<&InputSpec> {
        self.inputs.iter().find(|input| input.name == name)
    }

    /// Exact declarations win over wildcard patterns.
    pub fn find_output(&self, name: &str) -> Option<&OutputSpec> {
        self.outputs
            .iter()
            .find(|output| !output.is_pattern() && output.name == name)
            .or_else(|| {
                self.outputs
                    .iter()
                    .find(|output| output.is_pattern() && output.matches(name))
            })
    }

    /// Checks the declaration itself; run once when a module is registered.
    pub fn check(&self) -> Result<(), ContractError> {
        for input in &self.inputs {
            let single_key = matches!(&input.required_keys, Some(keys) if keys.len() == 1);
            if input.unwrap && !single_key {
                return Err(ContractError::InvalidUnwrap {
                    module: self.action(),
                    input: input.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Fills defaults, verifies required record keys, and unwraps
    /// single-key record lists into flat value lists.
    pub fn prepare_inputs(
        &self,
        step: &StepRef,
        mut provided: BTreeMap<String, Value>,
    ) -> Result<BTreeMap<String, Value>, ContractError> {
        if let Some(unknown) = provided.keys().find(|name| self.find_input(name).is_none()) {
            return Err(ContractError::UnexpectedInput {
                step: step.clone(),
                input: unknown.clone(),
                accepted: self.inputs.iter().map(|input| input.name.clone()).collect(),
            });
        }

        let mut prepared = BTreeMap::new();
        for spec in &self.inputs {
            let value = match provided.remove(&spec.name) {
                Some(value) => value,
                None => spec
                    .default
                    .clone()
                    .ok_or_else(|| ContractError::MissingInput {
                        step: step.clone(),
                        input: spec.name.clone(),
                    })?,
            };
            let value = match &spec.required_keys {
                Some(keys) => check_record_list(step, spec, keys, value)?,
                None => value,
            };
            prepared.insert(spec.name.clone(), value);
        }
        Ok(prepared)
    }

    pub fn check_outputs(&self, step: &StepRef, results: &ModuleResults) -> Result<(), ContractError> {
        for name in results.keys() {
            if self.find_output(name).is_none() {
                return Err(ContractError::UnexpectedOutput {
                    step: step.clone(),
                    output: name.clone(),
                });
            }
        }

        for declared in self.outputs.iter().filter(|output| !output.is_pattern()) {
            if !results.contains_key(&declared.name) {
                return Err(ContractError::MissingOutput {
                    step: step.clone(),
                    output: declared.name.clone(),
                });
            }
        }

        for (name, records) in results {
            let Some(keys) = self.find_output(name).and_then(|spec| spec.required_keys.as_ref())
            else {
                continue;
            };
            for record in records {
                if let Some(key) = keys.iter().find(|key| !record.contains_key(*key)) {
                    return Err(ContractError::MissingOutputKey {
                        step: step.clone(),
                        output: name.clone(),
                        key: key.clone(),
                        record: serde_json::to_string(record).unwrap_or_default(),
                    });
                }
            }
        }
        Ok(())
    }
}

fn check_record_list(
    step: &StepRef,
    spec: &InputSpec,
    keys: &[String],
    value: Value,
) -> Result<Value, ContractError> {
    let elements = match value {
        Value::Null => return Ok(Value::Null),
        Value::Array(elements) => elements,
        _ => {
            return Err(ContractError::NotARecordList {
                step: step.clone(),
                input: spec.name.clone(),
            })
        }
    };

    for element in &elements {
        let missing = match element {
            Value::Object(map) => keys.iter().find(|key| !map.contains_key(*key)),
            _ => keys.first(),
        };
        if let Some(key) = missing {
            return Err(ContractError::MissingKey {
                step: step.clone(),
                input: spec.name.clone(),
                key: key.clone(),
                element: element.to_string(),
            });
        }
    }

    if !spec.unwrap {
        return Ok(Value::Array(elements));
    }
    let key = &keys[0];
    Ok(Value::Array(
        elements
            .into_iter()
            .filter_map(|element| match element {
                Value::Object(mut map) => map.remove(key),
                _ => None,
            })
            .collect(),
    ))
}
