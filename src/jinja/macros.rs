use crate::jinja::types::Structural;
use std::collections::BTreeMap;

/// Inference-time view of a macro: what each parameter must look like, and
/// which free variables the body reaches for. Call sites re-demand the free
/// fragment and push argument shapes into the parameter slots.
#[derive(Clone, Debug)]
pub struct MacroDef {
    pub name: String,
    pub params: Vec<MacroParamShape>,
    pub free: BTreeMap<String, Structural>,
}

#[derive(Clone, Debug)]
pub struct MacroParamShape {
    pub name: String,
    /// Shape the body's uses demand of this parameter.
    pub expected: Structural,
    pub default: Option<Structural>,
}

impl MacroDef {
    /// The parameter a positional argument lands in.
    pub fn positional(&self, index: usize) -> Option<&MacroParamShape> {
        self.params.get(index)
    }

    pub fn named(&self, name: &str) -> Option<&MacroParamShape> {
        self.params.iter().find(|param| param.name == name)
    }
}
