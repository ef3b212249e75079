use crate::alert::StepRef;
use crate::contract::{ContractError, ModuleResults, ModuleSpec};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Resolved keyword inputs handed to a module, keyed by input name.
pub type ModuleInputs = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModuleError {
    #[error("invalid input '{input}': {reason}")]
    InvalidInput { input: String, reason: String },
    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistrationError {
    #[error("module '{0}' is registered twice")]
    Duplicate(String),
    #[error("module action '{0}' must be 'VERB SUBJECT'")]
    InvalidAction(String),
    #[error(transparent)]
    Contract(#[from] ContractError),
}

/// A scan or discovery operation. Expected operational failures (unreachable
/// hosts, timeouts) belong in the results as error records; `Err` is reserved
/// for problems that should abort the run.
pub trait Module {
    fn run(&mut self, ctx: &mut StepContext) -> Result<ModuleResults, ModuleError>;
}

/// Per-step handle given to modules: identifies the step and captures the
/// log lines and time spent inside the module.
#[derive(Debug)]
pub struct StepContext {
    step: StepRef,
    log: Vec<String>,
    duration: Duration,
}

impl StepContext {
    pub fn new(step: StepRef) -> Self {
        Self {
            step,
            log: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    pub fn step(&self) -> &StepRef {
        &self.step
    }

    pub fn log(&mut self, line: impl Into<String>) {
        let line = line.into();
        debug!(step = self.step.number, action = %self.step.action, "{line}");
        self.log.push(line);
    }

    pub fn lines(&self) -> &[String] {
        &self.log
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Runs `f`, adding its wall-clock time to the step's duration.
    pub fn timed<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        let start = Instant::now();
        let out = f(self);
        self.duration += start.elapsed();
        out
    }

    pub fn into_parts(self) -> (Vec<String>, Duration) {
        (self.log, self.duration)
    }
}

pub type ModuleFactory =
    Box<dyn Fn(&mut StepContext, ModuleInputs) -> Result<Box<dyn Module>, ModuleError>>;

pub struct ModuleEntry {
    spec: ModuleSpec,
    factory: ModuleFactory,
}

impl ModuleEntry {
    pub fn spec(&self) -> &ModuleSpec {
        &self.spec
    }

    pub fn instantiate(
        &self,
        ctx: &mut StepContext,
        inputs: ModuleInputs,
    ) -> Result<Box<dyn Module>, ModuleError> {
        (self.factory)(ctx, inputs)
    }
}

impl std::fmt::Debug for ModuleEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleEntry")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

/// Maps `(verb, subject)` action names to module declarations and constructors.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    modules: BTreeMap<(String, String), ModuleEntry>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry populated with the modules shipped in this crate.
    pub fn with_builtins() -> Result<Self, RegistrationError> {
        let mut registry = Self::new();
        for (spec, factory) in crate::modules::builtin_modules() {
            registry.register(spec, factory)?;
        }
        Ok(registry)
    }

    pub fn register<F>(&mut self, spec: ModuleSpec, factory: F) -> Result<(), RegistrationError>
    where
        F: Fn(&mut StepContext, ModuleInputs) -> Result<Box<dyn Module>, ModuleError> + 'static,
    {
        spec.check()?;
        let key = action_key(&spec.action())
            .ok_or_else(|| RegistrationError::InvalidAction(spec.action()))?;
        if self.modules.contains_key(&key) {
            return Err(RegistrationError::Duplicate(spec.action()));
        }
        self.modules.insert(
            key,
            ModuleEntry {
                spec,
                factory: Box::new(factory),
            },
        );
        Ok(())
    }

    pub fn lookup(&self, action: &str) -> Option<&ModuleEntry> {
        self.modules.get(&action_key(action)?)
    }

    pub fn specs(&self) -> impl Iterator<Item = &ModuleSpec> {
        self.modules.values().map(ModuleEntry::spec)
    }

    pub fn actions(&self) -> Vec<String> {
        self.specs().map(ModuleSpec::action).collect()
    }
}

/// Splits "discover  Domains and IPs" into ("discover", "domains and ips").
pub fn action_key(action: &str) -> Option<(String, String)> {
    let mut words = action.split_whitespace();
    let verb = words.next()?.to_lowercase();
    let subject = words.collect::<Vec<_>>().join(" ").to_lowercase();
    if subject.is_empty() {
        return None;
    }
    Some((verb, subject))
}

pub fn take_string_list(inputs: &ModuleInputs, name: &str) -> Result<Vec<String>, ModuleError> {
    match inputs.get(name) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                Value::Number(n) => Ok(n.to_string()),
                other => Err(ModuleError::InvalidInput {
                    input: name.to_string(),
                    reason: format!("expected a list of strings, found element {other}"),
                }),
            })
            .collect(),
        Some(Value::String(s)) => Ok(vec![s.clone()]),
        Some(other) => Err(ModuleError::InvalidInput {
            input: name.to_string(),
            reason: format!("expected a list of strings, found {other}"),
        }),
    }
}

pub fn take_optional_string(
    inputs: &ModuleInputs,
    name: &str,
) -> Result<Option<String>, ModuleError> {
    match inputs.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(ModuleError::InvalidInput {
            input: name.to_string(),
            reason: format!("expected a string, found {other}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{InputSpec, OutputSpec};
    use serde_json::json;

    struct Echo;

    impl Module for Echo {
        fn run(&mut self, ctx: &mut StepContext) -> Result<ModuleResults, ModuleError> {
            ctx.log("echo ran");
            Ok(ModuleResults::new())
        }
    }

    fn echo_spec() -> ModuleSpec {
        ModuleSpec::new("discover", "Echo Things", "test module")
            .input(InputSpec::scalar("value", "anything"))
            .output(OutputSpec::records("Things", &["thing"], "things"))
    }

    #[test]
    fn lookup_is_case_and_space_insensitive() {
        let mut registry = ModuleRegistry::new();
        registry
            .register(echo_spec(), |_, _| Ok(Box::new(Echo) as Box<dyn Module>))
            .unwrap();
        assert!(registry.lookup("discover Echo Things").is_some());
        assert!(registry.lookup("Discover   echo things").is_some());
        assert!(registry.lookup("scan Echo Things").is_none());
        assert!(registry.lookup("discover").is_none());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = ModuleRegistry::new();
        registry
            .register(echo_spec(), |_, _| Ok(Box::new(Echo) as Box<dyn Module>))
            .unwrap();
        let err = registry
            .register(echo_spec(), |_, _| Ok(Box::new(Echo) as Box<dyn Module>))
            .unwrap_err();
        assert_eq!(
            err,
            RegistrationError::Duplicate("discover Echo Things".to_string())
        );
    }

    #[test]
    fn builtins_register_cleanly() {
        let registry = ModuleRegistry::with_builtins().unwrap();
        assert!(registry.lookup("scan Ports").is_some());
        assert_eq!(
            registry.actions().len(),
            crate::modules::builtin_modules().len()
        );
    }

    #[test]
    fn builtin_clash_is_reported() {
        let mut registry = ModuleRegistry::with_builtins().unwrap();
        let (spec, factory) = crate::modules::builtin_modules().remove(0);
        let action = spec.action();
        assert_eq!(
            registry.register(spec, factory).unwrap_err(),
            RegistrationError::Duplicate(action)
        );
    }

    #[test]
    fn context_captures_log_and_time() {
        let mut ctx = StepContext::new(StepRef {
            number: 0,
            action: "discover Echo Things".to_string(),
            name: "echo".to_string(),
        });
        let results = ctx.timed(|ctx| Echo.run(ctx)).unwrap();
        assert!(results.is_empty());
        assert_eq!(ctx.lines(), ["echo ran".to_string()]);
    }

    #[test]
    fn string_list_inputs() {
        let mut inputs = ModuleInputs::new();
        inputs.insert("ips".to_string(), json!(["1.1.1.1", "2.2.2.2"]));
        inputs.insert("ports".to_string(), json!("22,80"));
        inputs.insert("bad".to_string(), json!([{"ip": "1.1.1.1"}]));
        assert_eq!(take_string_list(&inputs, "ips").unwrap().len(), 2);
        assert_eq!(take_string_list(&inputs, "ports").unwrap(), vec!["22,80"]);
        assert!(take_string_list(&inputs, "missing").unwrap().is_empty());
        assert!(take_string_list(&inputs, "bad").is_err());
        assert_eq!(
            take_optional_string(&inputs, "ports").unwrap().as_deref(),
            Some("22,80")
        );
    }
}
