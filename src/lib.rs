//! Context-shape inference for Jinja-style templates: given a template
//! source, work out the structure every free variable must have, and project
//! that structure to JSON Schema.

pub mod jinja;
