//! Modules shipped with the engine.

pub mod ports;

use crate::contract::ModuleSpec;
use crate::module::{Module, ModuleError, ModuleInputs, StepContext};

pub(crate) type BuiltinFactory =
    fn(&mut StepContext, ModuleInputs) -> Result<Box<dyn Module>, ModuleError>;

pub(crate) fn builtin_modules() -> Vec<(ModuleSpec, BuiltinFactory)> {
    vec![(ports::spec(), ports::create as BuiltinFactory)]
}
