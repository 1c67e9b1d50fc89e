use crate::jinja::filters::FilterSignature;
use std::collections::BTreeMap;

/// Shape attributed to a container indexed by `[...]` when the subscript
/// alone cannot decide between a list, a tuple and a dictionary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexedAs {
    List,
    Tuple,
    Dictionary,
    Any,
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Shape of `xs` in `xs[0]` when the index is an integer literal.
    pub indexed_with_integer: IndexedAs,
    /// Shape of `xs` in `xs[key]` when the index is a variable.
    pub indexed_with_variable: IndexedAs,
    /// Treat a name used both as a scalar and as a dictionary as a
    /// dictionary that extends the scalar, instead of a conflict.
    pub dictionaries_extend_scalars: bool,
    /// Reject surplus arguments to registered filters instead of visiting
    /// them unconstrained.
    pub strict_filter_arguments: bool,
    /// Additional filter signatures, looked up after the builtin table.
    pub custom_filters: BTreeMap<String, FilterSignature>,
    /// Expect conditions of `if` and operands of `not` to be scalars
    /// rather than values of any shape.
    pub boolean_conditions: bool,
    /// Project tuples as per-slot `items` arrays instead of a homogeneous
    /// element union.
    pub tuple_schema_per_slot: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            indexed_with_integer: IndexedAs::List,
            indexed_with_variable: IndexedAs::Dictionary,
            dictionaries_extend_scalars: false,
            strict_filter_arguments: false,
            custom_filters: BTreeMap::new(),
            boolean_conditions: false,
            tuple_schema_per_slot: false,
        }
    }
}

impl Config {
    pub fn with_custom_filter(
        mut self,
        name: impl Into<String>,
        signature: FilterSignature,
    ) -> Config {
        self.custom_filters.insert(name.into(), signature);
        self
    }
}
