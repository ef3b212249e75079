pub mod alert;
pub mod config;
pub mod contract;
pub mod error;
pub mod expect;
pub mod expression;
pub mod finding;
pub mod module;
pub mod modules;
pub mod output;
pub mod registry;
pub mod runner;
pub mod state;
pub mod step;
pub mod validation;

pub use alert::{Alert, AlertPayload, AlertsList, AlertsSummary, Severity, SeveritySummary, StepRef};
pub use config::{Config, OutputConfig, StatePaths};
pub use contract::{ContractError, InputSpec, ModuleResults, ModuleSpec, OutputSpec};
pub use error::{ConfigError, Error, Result};
pub use expression::{ExpectRule, FindExpr, InputValue, ParseError, Quantifier, RuleKind, UseExpr};
pub use finding::{Comparison, Record};
pub use module::{Module, ModuleError, ModuleInputs, ModuleRegistry, StepContext};
pub use output::{RunReport, OutputError};
pub use registry::{FindingsRegistry, RegistryError};
pub use runner::{RunOptions, RunOutcome, Runner};
pub use state::{FindingsMap, StateError};
pub use step::{Step, StepError, StepReport};
pub use validation::{validate_pipeline, Diagnostic, DiagnosticLevel};
