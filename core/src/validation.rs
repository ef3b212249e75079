//! Pre-flight check of a whole pipeline against the keys and attributes each
//! step will find in the registry, without running any module.

use crate::expression::InputValue;
use crate::finding::attribute_names;
use crate::state::FindingsMap;
use crate::step::Step;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    Error,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub location: Option<String>,
    pub message: String,
}

impl Diagnostic {
    fn error(location: Option<String>, message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Error,
            location,
            message: message.into(),
        }
    }

    fn warning(location: Option<String>, message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Warning,
            location,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.level, DiagnosticLevel::Error)
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagnosticLevel::Error => "error",
            DiagnosticLevel::Warning => "warning",
        };
        match &self.location {
            Some(location) => write!(f, "[{level}] {location}: {}", self.message),
            None => write!(f, "[{level}] {}", self.message),
        }
    }
}

/// Attribute names known for a finding key; `None` when nothing is known
/// about the records (empty initial data, outputs without required keys).
type KnownKeys = BTreeMap<String, Option<BTreeSet<String>>>;

pub fn validate_pipeline(initial: &FindingsMap, steps: &[Step]) -> Vec<Diagnostic> {
    let mut ctx = ValidationContext::new(initial);
    for step in steps {
        ctx.push(step.step_ref().to_string());
        validate_inputs(step, &mut ctx);
        let produced = produced_keys(step, &mut ctx);
        ctx.known.extend(produced);
        validate_expectations(step, &mut ctx);
        ctx.pop();
    }
    ctx.finish()
}

struct ValidationContext {
    stack: Vec<String>,
    known: KnownKeys,
    diagnostics: Vec<Diagnostic>,
}

impl ValidationContext {
    fn new(initial: &FindingsMap) -> Self {
        let known = initial
            .iter()
            .map(|(key, records)| (key.clone(), records.first().map(attribute_names)))
            .collect();
        Self {
            stack: Vec::new(),
            known,
            diagnostics: Vec::new(),
        }
    }

    fn push(&mut self, label: String) {
        self.stack.push(label);
    }

    fn pop(&mut self) {
        self.stack.pop();
    }

    fn location(&self) -> Option<String> {
        if self.stack.is_empty() {
            None
        } else {
            Some(self.stack.join(" > "))
        }
    }

    fn error(&mut self, message: impl Into<String>) {
        let diag = Diagnostic::error(self.location(), message);
        self.diagnostics.push(diag);
    }

    fn warning(&mut self, message: impl Into<String>) {
        let diag = Diagnostic::warning(self.location(), message);
        self.diagnostics.push(diag);
    }

    fn require_key(&mut self, key: &str) -> bool {
        if self.known.contains_key(key) {
            return true;
        }
        let known = self.known.keys().cloned().collect::<Vec<_>>().join(", ");
        self.error(format!(
            "unknown findings key: {key}; existing keys are: {known}"
        ));
        false
    }

    fn finish(self) -> Vec<Diagnostic> {
        self.diagnostics
    }
}

fn validate_inputs(step: &Step, ctx: &mut ValidationContext) {
    let spec = step.spec();
    for (name, input) in step.inputs() {
        let Some(declared) = spec.find_input(name) else {
            let accepted: Vec<&str> = spec.inputs.iter().map(|i| i.name.as_str()).collect();
            ctx.error(format!(
                "unknown input '{name}' (module accepts: {})",
                accepted.join(", ")
            ));
            continue;
        };

        match input {
            InputValue::Reference(expr) => {
                for key in &expr.keys {
                    if !ctx.require_key(key) {
                        continue;
                    }
                    let (Some(Some(attributes)), Some(required)) =
                        (ctx.known.get(key).cloned(), declared.required_keys.as_ref())
                    else {
                        continue;
                    };
                    let missing: Vec<&str> = required
                        .iter()
                        .filter(|attr| !attributes.contains(*attr))
                        .map(String::as_str)
                        .collect();
                    if !missing.is_empty() {
                        ctx.error(format!(
                            "findings key {key} does not provide attribute(s) {} required by input '{name}'",
                            missing.join(", ")
                        ));
                    }
                }
            }
            InputValue::Literal(value) => {
                if declared.required_keys.is_some()
                    && !matches!(value, Value::Array(_) | Value::Null)
                {
                    ctx.error(format!("input '{name}' must be a list of records"));
                }
            }
        }
    }

    for declared in &spec.inputs {
        if declared.default.is_none() && !step.inputs().contains_key(&declared.name) {
            ctx.error(format!("missing required input '{}'", declared.name));
        }
    }
}

fn produced_keys(step: &Step, ctx: &mut ValidationContext) -> KnownKeys {
    let mut produced = KnownKeys::new();
    for expr in step.find() {
        let attributes = step
            .spec()
            .find_output(&expr.key)
            .and_then(|output| output.required_keys.as_ref())
            .map(|keys| keys.iter().cloned().collect::<BTreeSet<_>>());
        if ctx.known.contains_key(&expr.alias) || produced.contains_key(&expr.alias) {
            ctx.error(format!(
                "findings key {} already exists; storing output {} there would overwrite it",
                expr.alias, expr.key
            ));
            continue;
        }
        produced.insert(expr.alias.clone(), attributes);
    }
    produced
}

fn validate_expectations(step: &Step, ctx: &mut ValidationContext) {
    for rule in step.expect() {
        ctx.push(format!("rule '{}'", rule.text));
        let all_known = rule
            .referenced_keys()
            .into_iter()
            .fold(true, |ok, key| ctx.require_key(key) && ok);
        if all_known {
            if let Some((left, right)) = rule.kind.compared_pair() {
                let attributes = (ctx.known.get(left).cloned(), ctx.known.get(right).cloned());
                if let (Some(Some(left_attrs)), Some(Some(right_attrs))) = attributes {
                    if left_attrs.is_disjoint(&right_attrs) {
                        ctx.warning(format!(
                            "{left} and {right} may share no common attribute; the comparison would fail"
                        ));
                    }
                }
            }
        }
        ctx.pop();
    }
}
