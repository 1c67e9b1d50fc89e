pub mod ast;
pub mod config;
pub mod examples;
pub mod filters;
pub mod generator;
pub mod infer;
pub mod macros;
pub mod parser;
pub mod schema;
pub mod types;

pub use ast::{BinaryOp, Expr, MacroParam, Stmt, Target, UnaryOp};
pub use config::{Config, IndexedAs};
pub use examples::{all_examples, ExampleTemplate};
pub use filters::{
    ArgKind, BuiltinFilter, BuiltinTest, ElementKind, FilterSignature, InputKind, ResultKind,
};
pub use generator::generate_context;
pub use infer::{
    infer, infer_from_ast, infer_with_loader, Fragment, InferError, Scope, TemplateLoader,
};
pub use macros::{MacroDef, MacroParamShape};
pub use parser::{parse, ParseError};
pub use schema::{to_json_schema, to_json_schema_string};
pub use types::{
    merge, merge_with, Kind, MergeError, MergeMode, MergeOptions, Meta, Structural,
};
