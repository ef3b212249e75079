use crate::alert::{Alert, StepRef};
use crate::contract::{ContractError, ModuleSpec};
use crate::error::ConfigError;
use crate::expect;
use crate::expression::{
    parse_expect_rules, parse_find_mapping, parse_inputs, ExpectRule, FindExpr, InputValue,
};
use crate::module::{ModuleError, ModuleInputs, ModuleRegistry, StepContext};
use crate::registry::{FindingsRegistry, RegistryError};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::info;

const RESERVED: [&str; 3] = ["find", "expect", "name"];

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Contract(#[from] ContractError),
    #[error("{step}: {source}")]
    Registry {
        step: StepRef,
        source: RegistryError,
    },
    #[error(
        "{step}: unable to initialize action \"{}\": {source}\n\n{definition}\nresolved inputs:\n{resolved}",
        step.action
    )]
    Initialize {
        step: StepRef,
        source: ModuleError,
        definition: String,
        resolved: String,
    },
    #[error("{step}: module failed: {source}")]
    Module { step: StepRef, source: ModuleError },
    #[error("{step}: module is no longer registered")]
    UnknownModule { step: StepRef },
    #[error("{step}: module did not produce output '{output}' named in 'find'")]
    MissingFindOutput { step: StepRef, output: String },
}

/// Timing and log of one step, as reported after the run.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub number: usize,
    pub name: String,
    pub action: String,
    pub executed: bool,
    pub duration_secs: f64,
    pub log: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Step {
    number: usize,
    action: String,
    name: String,
    definition: Value,
    spec: ModuleSpec,
    inputs: BTreeMap<String, InputValue>,
    find: Vec<FindExpr>,
    expect: Vec<ExpectRule>,
    resolved: Option<ModuleInputs>,
    log: Vec<String>,
    duration: Duration,
    executed: bool,
}

impl Step {
    /// Builds step `number` from one entry of the configuration's `run` list.
    pub fn from_config(
        number: usize,
        definition: Value,
        modules: &ModuleRegistry,
    ) -> Result<Self, ConfigError> {
        let Value::Object(raw) = &definition else {
            return Err(ConfigError::InvalidStep { number });
        };

        let actions: Vec<&String> = raw
            .keys()
            .filter(|key| !RESERVED.contains(&key.as_str()))
            .collect();
        let action = match actions.as_slice() {
            [] => return Err(ConfigError::NoAction { number }),
            [action] => action.to_string(),
            _ => {
                return Err(ConfigError::MultipleActions {
                    number,
                    actions: actions.iter().map(|a| a.to_string()).collect(),
                })
            }
        };

        let entry = modules
            .lookup(&action)
            .ok_or_else(|| ConfigError::UnknownModule {
                number,
                action: action.clone(),
                available: modules.actions(),
            })?;

        let name = match raw.get("name") {
            Some(Value::String(name)) => name.clone(),
            _ => action.clone(),
        };
        let step = StepRef {
            number,
            action: action.clone(),
            name: name.clone(),
        };

        let inputs = match raw.get(&action) {
            Some(Value::Object(params)) => parse_inputs(params),
            Some(Value::Null) | None => Ok(BTreeMap::new()),
            Some(_) => return Err(ConfigError::InvalidParameters { step }),
        }
        .map_err(|source| ConfigError::Expression {
            step: step.clone(),
            source,
        })?;

        let find_exprs = match raw.get("find") {
            Some(value) => string_list(&step, "find", value)?,
            None => return Err(ConfigError::MissingFind { step }),
        };
        let find =
            parse_find_mapping(find_exprs.as_slice()).map_err(|source| ConfigError::Expression {
                step: step.clone(),
                source,
            })?;
        for expr in &find {
            if entry.spec().find_output(&expr.key).is_none() {
                return Err(ConfigError::UnknownOutput {
                    step,
                    output: expr.key.clone(),
                    declared: entry
                        .spec()
                        .outputs
                        .iter()
                        .map(|output| output.name.clone())
                        .collect(),
                });
            }
        }

        let rules = match raw.get("expect") {
            Some(value) => string_list(&step, "expect", value)?,
            None => Vec::new(),
        };
        let expect =
            parse_expect_rules(rules.as_slice()).map_err(|source| ConfigError::Expression {
                step: step.clone(),
                source,
            })?;

        info!(step = number, action = %action, "step configured");
        Ok(Self {
            number,
            action,
            name,
            spec: entry.spec().clone(),
            definition,
            inputs,
            find,
            expect,
            resolved: None,
            log: Vec::new(),
            duration: Duration::ZERO,
            executed: false,
        })
    }

    pub fn number(&self) -> usize {
        self.number
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &ModuleSpec {
        &self.spec
    }

    pub fn inputs(&self) -> &BTreeMap<String, InputValue> {
        &self.inputs
    }

    pub fn find(&self) -> &[FindExpr] {
        &self.find
    }

    pub fn expect(&self) -> &[ExpectRule] {
        &self.expect
    }

    pub fn step_ref(&self) -> StepRef {
        StepRef {
            number: self.number,
            action: self.action.clone(),
            name: self.name.clone(),
        }
    }

    /// The step as written in the configuration, rendered as YAML.
    pub fn definition(&self) -> String {
        serde_yaml::to_string(&self.definition).unwrap_or_default()
    }

    /// Inputs after `use` expressions were resolved, rendered as YAML.
    pub fn resolved_inputs(&self) -> Option<String> {
        self.resolved
            .as_ref()
            .map(|inputs| serde_yaml::to_string(inputs).unwrap_or_default())
    }

    pub fn log(&self) -> &[String] {
        &self.log
    }

    pub fn report(&self) -> StepReport {
        StepReport {
            number: self.number,
            name: self.name.clone(),
            action: self.action.clone(),
            executed: self.executed,
            duration_secs: self.duration.as_secs_f64(),
            log: self.log.clone(),
        }
    }

    /// Resolves `use` references against the registry; literals pass through.
    pub fn load_findings(&mut self, registry: &FindingsRegistry) -> Result<(), StepError> {
        let mut resolved = ModuleInputs::new();
        for (name, input) in &self.inputs {
            let value = registry
                .resolve_input(input)
                .map_err(|source| StepError::Registry {
                    step: self.step_ref(),
                    source,
                })?;
            resolved.insert(name.clone(), value);
        }
        self.resolved = Some(resolved);
        Ok(())
    }

    /// Runs the module, stores its outputs under their aliases and returns
    /// the alerts raised by this step's expectations.
    pub fn execute(
        &mut self,
        registry: &mut FindingsRegistry,
        modules: &ModuleRegistry,
    ) -> Result<Vec<Alert>, StepError> {
        if self.resolved.is_none() {
            self.load_findings(registry)?;
        }
        let step = self.step_ref();
        let entry = modules
            .lookup(&self.action)
            .ok_or_else(|| StepError::UnknownModule { step: step.clone() })?;
        let provided = self.resolved.clone().unwrap_or_default();
        let prepared = entry.spec().prepare_inputs(&step, provided)?;

        let mut ctx = StepContext::new(step.clone());
        let instantiated = ctx.timed(|ctx| entry.instantiate(ctx, prepared));
        let mut module = match instantiated {
            Ok(module) => module,
            Err(source) => {
                self.absorb(ctx);
                return Err(StepError::Initialize {
                    step,
                    source,
                    definition: self.definition(),
                    resolved: self.resolved_inputs().unwrap_or_default(),
                });
            }
        };
        let outcome = ctx.timed(|ctx| module.run(ctx));
        self.absorb(ctx);
        let mut results = outcome.map_err(|source| StepError::Module {
            step: step.clone(),
            source,
        })?;
        self.executed = true;
        info!(
            step = self.number,
            action = %self.action,
            "took {:.3}s and produced {} log line(s)",
            self.duration.as_secs_f64(),
            self.log.len()
        );

        entry.spec().check_outputs(&step, &results)?;

        for expr in &self.find {
            let records = results
                .remove(&expr.key)
                .ok_or_else(|| StepError::MissingFindOutput {
                    step: step.clone(),
                    output: expr.key.clone(),
                })?;
            registry
                .set(expr.alias.clone(), records)
                .map_err(|source| StepError::Registry {
                    step: step.clone(),
                    source,
                })?;
        }

        let mut alerts = Vec::new();
        for rule in &self.expect {
            let alert = expect::evaluate(rule, registry, &step).map_err(|source| {
                StepError::Registry {
                    step: step.clone(),
                    source,
                }
            })?;
            alerts.extend(alert);
        }
        Ok(alerts)
    }

    fn absorb(&mut self, ctx: StepContext) {
        let (log, duration) = ctx.into_parts();
        self.log.extend(log);
        self.duration += duration;
    }
}

fn string_list(step: &StepRef, keyword: &str, value: &Value) -> Result<Vec<String>, ConfigError> {
    let invalid = || ConfigError::InvalidKeyword {
        step: step.clone(),
        keyword: keyword.to_string(),
    };
    match value {
        Value::Null => Ok(Vec::new()),
        Value::String(single) => Ok(vec![single.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|item| item.as_str().map(str::to_string).ok_or_else(invalid))
            .collect(),
        _ => Err(invalid()),
    }
}
