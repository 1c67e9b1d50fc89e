use crate::jinja::ast::{BinaryOp, Expr, Stmt, Target, UnaryOp};
use crate::jinja::config::{Config, IndexedAs};
use crate::jinja::filters::{ArgKind, BuiltinFilter, BuiltinTest, ElementKind, FilterSignature, InputKind, ResultKind};
use crate::jinja::macros::{MacroDef, MacroParamShape};
use crate::jinja::parser::{parse, ParseError};
use crate::jinja::types::{merge_fields, merge_with, Kind, MergeError, MergeMode, MergeOptions, Structural};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Free variables collected from a sub-tree: name to demanded shape.
pub type Fragment = BTreeMap<String, Structural>;

/// Nesting bound for include/import/extends chains. Cycles and runaway
/// nesting silently stop contributing constraints.
const MAX_TEMPLATE_DEPTH: usize = 16;

#[derive(Debug)]
pub enum InferError {
    Parse(ParseError),
    Merge(MergeError),
    /// A construct the analyzer cannot assign a shape to.
    InvalidExpression { line: u32, message: String },
    /// The shape demanded by the position and the shape produced by the
    /// expression cannot be reconciled.
    UnexpectedExpression {
        expected: Structural,
        actual: Structural,
        line: u32,
    },
}

impl fmt::Display for InferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InferError::Parse(err) => err.fmt(f),
            InferError::Merge(err) => err.fmt(f),
            InferError::InvalidExpression { line, message } => {
                write!(f, "line {line}: {message}")
            }
            InferError::UnexpectedExpression {
                expected,
                actual,
                line,
            } => write!(
                f,
                "conflict on line {line}: got structure {actual}, expected {expected}"
            ),
        }
    }
}

impl std::error::Error for InferError {}

impl From<ParseError> for InferError {
    fn from(err: ParseError) -> InferError {
        InferError::Parse(err)
    }
}

impl From<MergeError> for InferError {
    fn from(err: MergeError) -> InferError {
        InferError::Merge(err)
    }
}

/// Source access for `include`, `import` and `extends`. A missing template
/// contributes no constraint.
pub trait TemplateLoader {
    fn load(&self, name: &str) -> Option<String>;
}

impl TemplateLoader for BTreeMap<String, String> {
    fn load(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Locally bound names, one map per lexical frame.
#[derive(Clone, Debug)]
pub struct Scope {
    frames: Vec<BTreeMap<String, Structural>>,
}

impl Default for Scope {
    fn default() -> Self {
        Scope::new()
    }
}

impl Scope {
    pub fn new() -> Scope {
        Scope {
            frames: vec![BTreeMap::new()],
        }
    }

    pub fn push(&mut self) {
        self.frames.push(BTreeMap::new());
    }

    pub fn pop(&mut self) -> BTreeMap<String, Structural> {
        self.frames.pop().unwrap_or_default()
    }

    pub fn lookup(&self, name: &str) -> Option<&Structural> {
        self.frames.iter().rev().find_map(|frame| frame.get(name))
    }

    pub fn binds(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    /// Binds in the top frame.
    pub fn bind(&mut self, name: impl Into<String>, value: Structural) {
        if let Some(frame) = self.frames.last_mut() {
            frame.insert(name.into(), value);
        }
    }

    /// Replaces the innermost existing binding, or binds in the top frame
    /// when the name is new.
    pub fn rebind_outer(&mut self, name: &str, value: Structural) {
        for frame in self.frames.iter_mut().rev() {
            if frame.contains_key(name) {
                frame.insert(name.to_string(), value);
                return;
            }
        }
        self.bind(name, value);
    }

    fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

pub struct Env<'a> {
    config: &'a Config,
    loader: Option<&'a dyn TemplateLoader>,
    scope: Scope,
    macros: BTreeMap<String, MacroDef>,
    depth: usize,
}

impl<'a> Env<'a> {
    fn new(config: &'a Config, loader: Option<&'a dyn TemplateLoader>) -> Env<'a> {
        Env {
            config,
            loader,
            scope: Scope::new(),
            macros: BTreeMap::new(),
            depth: 0,
        }
    }

    fn opts(&self) -> MergeOptions {
        MergeOptions {
            mode: MergeMode::Strict,
            dict_extends_scalar: self.config.dictionaries_extend_scalars,
        }
    }

    fn weak_opts(&self) -> MergeOptions {
        MergeOptions {
            mode: MergeMode::Weak,
            dict_extends_scalar: self.config.dictionaries_extend_scalars,
        }
    }

    fn condition_shape(&self, line: u32) -> Structural {
        if self.config.boolean_conditions {
            Structural::scalar().at(line)
        } else {
            Structural::unknown().at(line)
        }
    }
}

fn join(a: &Fragment, b: &Fragment, opts: &MergeOptions) -> Result<Fragment, InferError> {
    merge_fields(a, b, opts).map_err(InferError::from)
}

/// The role a sub-expression plays: the shape its syntactic position
/// demands of it. Flows downward while the collected structure flows up.
#[derive(Clone, Debug)]
pub(crate) struct Context {
    predicted: Structural,
}

impl Context {
    fn expecting(predicted: Structural) -> Context {
        Context { predicted }
    }

    fn predicted(&self) -> Structural {
        self.predicted.clone()
    }

    fn predicted_labeled(&self, label: &str) -> Structural {
        self.predicted.clone().labeled(label)
    }

    /// Checks that what the node produces fits what its position demands.
    fn meet(&self, actual: &Structural, line: u32, opts: &MergeOptions) -> Result<(), InferError> {
        match merge_with(&self.predicted, actual, opts) {
            Ok(_) => Ok(()),
            Err(_) => Err(InferError::UnexpectedExpression {
                expected: self.predicted.clone(),
                actual: actual.clone(),
                line,
            }),
        }
    }
}

pub(crate) fn visit_expr(
    expr: &Expr,
    ctx: &Context,
    env: &mut Env,
) -> Result<(Structural, Fragment), InferError> {
    let opts = env.opts();
    match expr {
        Expr::Const { value, line } => {
            ctx.meet(&Structural::scalar(), *line, &opts)?;
            let rtype = Structural::constant_scalar(value.clone()).at(*line);
            Ok((rtype, Fragment::new()))
        }

        Expr::Name { name, line } => {
            let predicted = ctx.predicted_labeled(name);
            if env.scope.binds(name) {
                let binding = env
                    .scope
                    .lookup(name)
                    .cloned()
                    .unwrap_or_else(Structural::unknown);
                let mut merged = merge_with(&binding, &predicted, &opts)?;
                // the binding's provenance is authoritative for a local name
                merged.meta.constant = binding.meta.constant;
                merged.meta.value = binding.meta.value.clone();
                merged.meta.may_be_defined = binding.meta.may_be_defined;
                env.scope.rebind_outer(name, merged.clone());
                return Ok((merged, Fragment::new()));
            }
            let mut fragment = Fragment::new();
            fragment.insert(name.clone(), predicted.clone());
            Ok((predicted, fragment))
        }

        Expr::Getattr { node, attr, line } => {
            let field = ctx.predicted_labeled(attr);
            let inner = Context::expecting(
                Structural::dictionary_of(attr.clone(), field).at(*line),
            );
            let (node_rtype, fragment) = visit_expr(node, &inner, env)?;
            let rtype = node_rtype
                .fields()
                .and_then(|fields| fields.get(attr.as_str()).cloned())
                .unwrap_or_else(|| ctx.predicted());
            Ok((rtype, fragment))
        }

        Expr::Getitem { node, index, line } => visit_getitem(node, index, *line, ctx, env),

        Expr::Slice {
            start,
            stop,
            step,
            line,
        } => {
            let mut fragment = Fragment::new();
            for part in [start, stop, step].into_iter().flatten() {
                let scalar = Context::expecting(Structural::scalar().at(part.line()));
                let (_, f) = visit_expr(part, &scalar, env)?;
                fragment = join(&fragment, &f, &opts)?;
            }
            Ok((Structural::unknown().at(*line), fragment))
        }

        Expr::Filter {
            node,
            name,
            args,
            kwargs,
            line,
        } => visit_filter(node, name, args, kwargs, *line, ctx, env),

        Expr::Test {
            node,
            name,
            negated,
            args,
            line,
        } => visit_test(node, name, *negated, args, *line, ctx, env),

        Expr::Call {
            callee,
            args,
            kwargs,
            line,
        } => visit_call(callee, args, kwargs, *line, ctx, env),

        Expr::CondExpr {
            test,
            then,
            otherwise,
            line,
        } => {
            let test_ctx = Context::expecting(env.condition_shape(test.line()));
            let (_, test_frag) = visit_expr(test, &test_ctx, env)?;
            let (then_rtype, then_frag) = visit_expr(then, ctx, env)?;
            let (else_rtype, else_frag) = match otherwise {
                Some(other) => visit_expr(other, ctx, env)?,
                None => (Structural::unknown().at(*line), Fragment::new()),
            };
            let weak = env.weak_opts();
            let branches = join(&then_frag, &else_frag, &weak)?;
            let fragment = join(&test_frag, &branches, &opts)?;
            let rtype = merge_with(&then_rtype, &else_rtype, &weak)?;
            Ok((rtype, fragment))
        }

        Expr::BinOp {
            op,
            left,
            right,
            line,
        } => {
            if op.is_boolean() {
                let (l_rtype, l_frag) = visit_expr(left, ctx, env)?;
                let (r_rtype, r_frag) = visit_expr(right, ctx, env)?;
                let rtype = merge_with(&l_rtype, &r_rtype, &opts)?;
                return Ok((rtype, join(&l_frag, &r_frag, &opts)?));
            }
            let operand_shape = |node: &Expr| match op {
                // membership says nothing about the shapes involved
                BinaryOp::In | BinaryOp::NotIn => Structural::unknown().at(node.line()),
                _ => Structural::scalar().at(node.line()),
            };
            let (_, l_frag) = visit_expr(left, &Context::expecting(operand_shape(left)), env)?;
            let (_, r_frag) = visit_expr(right, &Context::expecting(operand_shape(right)), env)?;
            ctx.meet(&Structural::scalar(), *line, &opts)?;
            Ok((
                Structural::scalar().at(*line),
                join(&l_frag, &r_frag, &opts)?,
            ))
        }

        Expr::Unary { op, node, line } => {
            let predicted = match op {
                UnaryOp::Not => env.condition_shape(node.line()),
                UnaryOp::Neg | UnaryOp::Pos => Structural::scalar().at(node.line()),
            };
            let (_, fragment) = visit_expr(node, &Context::expecting(predicted), env)?;
            Ok((Structural::scalar().at(*line), fragment))
        }

        Expr::Concat { nodes, line } => {
            ctx.meet(&Structural::scalar(), *line, &opts)?;
            let mut fragment = Fragment::new();
            for node in nodes {
                let scalar = Context::expecting(Structural::scalar().at(node.line()));
                let (_, f) = visit_expr(node, &scalar, env)?;
                fragment = join(&fragment, &f, &opts)?;
            }
            Ok((Structural::scalar().at(*line), fragment))
        }

        Expr::ListLit { items, line } => {
            ctx.meet(&Structural::list(Structural::unknown()), *line, &opts)?;
            let merged = merge_with(
                &Structural::list(Structural::unknown()).at(*line),
                &ctx.predicted(),
                &opts,
            )?;
            let element_predicted = merged
                .element()
                .cloned()
                .unwrap_or_else(Structural::unknown);
            let mut fragment = Fragment::new();
            let mut element: Option<Structural> = None;
            for item in items {
                let item_ctx = Context::expecting(element_predicted.clone());
                let (item_rtype, item_frag) = visit_expr(item, &item_ctx, env)?;
                fragment = join(&fragment, &item_frag, &opts)?;
                element = Some(match element {
                    Some(current) => merge_with(&current, &item_rtype, &opts)?,
                    None => item_rtype,
                });
            }
            let mut rtype =
                Structural::list(element.unwrap_or_else(Structural::unknown)).at(*line);
            rtype.meta.constant = true;
            Ok((rtype, fragment))
        }

        Expr::TupleLit { items, line } => {
            ctx.meet(&Structural::unsized_tuple(), *line, &opts)?;
            let mut fragment = Fragment::new();
            let mut item_rtypes = Vec::new();
            for item in items {
                let (item_rtype, item_frag) = visit_expr(item, ctx, env)?;
                fragment = join(&fragment, &item_frag, &opts)?;
                item_rtypes.push(item_rtype);
            }
            let mut rtype = Structural::tuple(item_rtypes).at(*line);
            rtype.meta.constant = true;
            Ok((rtype, fragment))
        }

        Expr::DictLit { items, line } => {
            ctx.meet(&Structural::empty_dictionary(), *line, &opts)?;
            let mut fragment = Fragment::new();
            let mut fields = BTreeMap::new();
            for (key, value) in items {
                let value_ctx = Context::expecting(Structural::unknown().at(value.line()));
                let (value_rtype, value_frag) = visit_expr(value, &value_ctx, env)?;
                fragment = join(&fragment, &value_frag, &opts)?;
                let key_ctx = Context::expecting(Structural::scalar().at(key.line()));
                let (_, key_frag) = visit_expr(key, &key_ctx, env)?;
                fragment = join(&fragment, &key_frag, &opts)?;
                if let Expr::Const { value: key_value, .. } = key {
                    let field_name = match key_value {
                        Value::String(text) => text.clone(),
                        other => other.to_string(),
                    };
                    fields.insert(field_name, value_rtype);
                }
            }
            let mut rtype = Structural::dictionary(fields).at(*line);
            rtype.meta.constant = true;
            Ok((rtype, fragment))
        }
    }
}

fn visit_getitem(
    node: &Expr,
    index: &Expr,
    line: u32,
    ctx: &Context,
    env: &mut Env,
) -> Result<(Structural, Fragment), InferError> {
    let opts = env.opts();
    let node_predicted = match index {
        Expr::Const {
            value: Value::Number(number),
            ..
        } => match env.config.indexed_with_integer {
            IndexedAs::List => Structural::list(ctx.predicted()).at(line),
            IndexedAs::Tuple => match number.as_u64() {
                Some(slot) => {
                    let slot = slot as usize;
                    let mut items = vec![Structural::unknown(); slot + 1];
                    items[slot] = ctx.predicted();
                    Structural::tuple(items).at(line)
                }
                // negative indexes cannot pick a tuple slot
                None => Structural::list(ctx.predicted()).at(line),
            },
            IndexedAs::Dictionary => {
                Structural::dictionary_of(number.to_string(), ctx.predicted()).at(line)
            }
            IndexedAs::Any => Structural::unknown().at(line),
        },
        Expr::Const {
            value: Value::String(key),
            ..
        } => Structural::dictionary_of(key.clone(), ctx.predicted_labeled(key)).at(line),
        Expr::Const { value, .. } => {
            return Err(InferError::InvalidExpression {
                line,
                message: format!(
                    "{value} is not supported as an index for a list or a key for a dictionary"
                ),
            })
        }
        Expr::Slice { .. } => merge_with(
            &Structural::list(Structural::unknown()).at(line),
            &ctx.predicted(),
            &opts,
        )?,
        _ => match env.config.indexed_with_variable {
            IndexedAs::List => Structural::list(ctx.predicted()).at(line),
            IndexedAs::Tuple => Structural::unsized_tuple().at(line),
            IndexedAs::Dictionary => Structural::empty_dictionary().at(line),
            IndexedAs::Any => Structural::unknown().at(line),
        },
    };

    let index_ctx = Context::expecting(Structural::scalar().at(index.line()));
    let (_, index_frag) = visit_expr(index, &index_ctx, env)?;

    let (node_rtype, node_frag) = visit_expr(node, &Context::expecting(node_predicted), env)?;
    let rtype = getitem_result(&node_rtype, index).unwrap_or_else(|| ctx.predicted());
    Ok((rtype, join(&node_frag, &index_frag, &opts)?))
}

fn getitem_result(container: &Structural, index: &Expr) -> Option<Structural> {
    match (&container.kind, index) {
        (Kind::List(element), _) => Some(element.as_ref().clone()),
        (
            Kind::Tuple(Some(items)),
            Expr::Const {
                value: Value::Number(number),
                ..
            },
        ) => number
            .as_u64()
            .and_then(|slot| items.get(slot as usize))
            .cloned(),
        (
            Kind::Dictionary(fields),
            Expr::Const {
                value: Value::String(key),
                ..
            },
        ) => fields.get(key.as_str()).cloned(),
        _ => None,
    }
}

fn visit_filter(
    node: &Expr,
    name: &str,
    args: &[Expr],
    kwargs: &[(String, Expr)],
    line: u32,
    ctx: &Context,
    env: &mut Env,
) -> Result<(Structural, Fragment), InferError> {
    let opts = env.opts();
    let signature = BuiltinFilter::from_name(name)
        .map(|filter| filter.signature())
        .or_else(|| env.config.custom_filters.get(name).cloned());

    let Some(signature) = signature else {
        // Unknown filter: its result is unknowable and its operand is only
        // constrained by the position the whole expression sits in.
        let inner = Context::expecting(Structural::unknown().at(node.line()));
        let (_, mut fragment) = visit_expr(node, &inner, env)?;
        for arg in args {
            let arg_ctx = Context::expecting(Structural::unknown().at(arg.line()));
            let (_, f) = visit_expr(arg, &arg_ctx, env)?;
            fragment = join(&fragment, &f, &opts)?;
        }
        for (_, value) in kwargs {
            let arg_ctx = Context::expecting(Structural::unknown().at(value.line()));
            let (_, f) = visit_expr(value, &arg_ctx, env)?;
            fragment = join(&fragment, &f, &opts)?;
        }
        return Ok((Structural::unknown().at(line), fragment));
    };

    let mut fragment = Fragment::new();
    let mut consumed_args = 0;
    let (node_predicted, rtype) = match signature.result {
        ResultKind::Scalar => {
            ctx.meet(&Structural::scalar(), line, &opts)?;
            (
                input_shape(&signature, node.line()),
                Structural::scalar().at(line),
            )
        }
        ResultKind::List => {
            ctx.meet(&Structural::list(Structural::unknown()), line, &opts)?;
            let result = merge_with(
                &Structural::list(Structural::unknown()).at(line),
                &ctx.predicted(),
                &opts,
            )?;
            (Structural::unknown().at(node.line()), result)
        }
        ResultKind::Dictionary => (
            input_shape(&signature, node.line()),
            Structural::empty_dictionary().at(line),
        ),
        ResultKind::SameAsInput => {
            ctx.meet(&Structural::list(Structural::unknown()), line, &opts)?;
            let flowed = merge_with(
                &Structural::list(Structural::unknown()).at(line),
                &ctx.predicted(),
                &opts,
            )?;
            (flowed.clone(), flowed)
        }
        ResultKind::ElementOfInput => (
            Structural::list(ctx.predicted()).at(node.line()),
            ctx.predicted(),
        ),
        ResultKind::NestedList => {
            let rows = Structural::list(Structural::list(Structural::unknown()));
            ctx.meet(&rows, line, &opts)?;
            let merged = merge_with(&rows.at(line), &ctx.predicted(), &opts)?;
            let operand = merged
                .element()
                .cloned()
                .unwrap_or_else(|| Structural::list(Structural::unknown()));
            (operand, merged)
        }
        ResultKind::PairList => {
            let pairs = Structural::list(Structural::tuple(vec![
                Structural::scalar(),
                Structural::unknown(),
            ]));
            ctx.meet(&pairs, line, &opts)?;
            (
                Structural::empty_dictionary().at(node.line()),
                pairs.at(line),
            )
        }
        ResultKind::InputWithDefault => {
            let fallback = args.first().ok_or_else(|| InferError::InvalidExpression {
                line,
                message: format!("`{name}` filter needs a fallback argument"),
            })?;
            consumed_args = 1;
            let fallback_ctx = Context::expecting(Structural::unknown().at(fallback.line()));
            let (fallback_rtype, fallback_frag) = visit_expr(fallback, &fallback_ctx, env)?;
            fragment = join(&fragment, &fallback_frag, &opts)?;
            let mut operand = merge_with(&ctx.predicted(), &fallback_rtype, &opts)?;
            operand.meta.used_with_default = true;
            operand.meta.value = fallback_rtype.meta.value.clone();
            (operand.clone(), operand)
        }
        ResultKind::AttributeOfInput => {
            let key = args.first().ok_or_else(|| InferError::InvalidExpression {
                line,
                message: format!("`{name}` filter needs an attribute name"),
            })?;
            consumed_args = 1;
            let key_ctx = Context::expecting(Structural::scalar().at(key.line()));
            let (_, key_frag) = visit_expr(key, &key_ctx, env)?;
            fragment = join(&fragment, &key_frag, &opts)?;
            match key.as_string_literal() {
                Some(attr) => (
                    Structural::dictionary_of(attr.to_string(), ctx.predicted_labeled(attr))
                        .at(node.line()),
                    ctx.predicted(),
                ),
                None => (
                    Structural::empty_dictionary().at(node.line()),
                    Structural::unknown().at(line),
                ),
            }
        }
    };

    let (_, node_frag) = visit_expr(node, &Context::expecting(node_predicted), env)?;
    fragment = join(&fragment, &node_frag, &opts)?;

    for (position, arg) in args.iter().enumerate().skip(consumed_args) {
        let declared = signature.args.get(position);
        if declared.is_none() && env.config.strict_filter_arguments {
            return Err(InferError::InvalidExpression {
                line,
                message: format!(
                    "`{name}` filter takes at most {} arguments",
                    signature.args.len()
                ),
            });
        }
        let predicted = match declared {
            Some(ArgKind::Scalar) => Structural::scalar().at(arg.line()),
            _ => Structural::unknown().at(arg.line()),
        };
        let (_, f) = visit_expr(arg, &Context::expecting(predicted), env)?;
        fragment = join(&fragment, &f, &opts)?;
    }
    for (_, value) in kwargs {
        let arg_ctx = Context::expecting(Structural::unknown().at(value.line()));
        let (_, f) = visit_expr(value, &arg_ctx, env)?;
        fragment = join(&fragment, &f, &opts)?;
    }

    Ok((rtype, fragment))
}

fn input_shape(signature: &FilterSignature, line: u32) -> Structural {
    let shape = match signature.input {
        InputKind::Scalar => Structural::scalar(),
        InputKind::List => {
            let element = match signature.element {
                ElementKind::Scalar => Structural::scalar(),
                ElementKind::Any => Structural::unknown(),
            };
            Structural::list(element)
        }
        InputKind::Dictionary => Structural::empty_dictionary(),
        InputKind::Any => Structural::unknown(),
    };
    shape.at(line)
}

fn visit_test(
    node: &Expr,
    name: &str,
    negated: bool,
    args: &[Expr],
    line: u32,
    ctx: &Context,
    env: &mut Env,
) -> Result<(Structural, Fragment), InferError> {
    let opts = env.opts();
    let Some(test) = BuiltinTest::from_name(name) else {
        return Err(InferError::InvalidExpression {
            line,
            message: format!("unknown test `{name}`"),
        });
    };
    ctx.meet(&Structural::scalar(), line, &opts)?;

    let hint = test.operand_hint().at(node.line());
    let (_, mut fragment) = visit_expr(node, &Context::expecting(hint), env)?;

    if test.checks_definedness() {
        if let Expr::Name { name: var, .. } = node {
            if let Some(entry) = fragment.get_mut(var.as_str()) {
                // `is not defined` observes the same thing as `is undefined`
                let checks_defined = matches!(test, BuiltinTest::Defined) != negated;
                if checks_defined {
                    entry.meta.checked_as_defined = true;
                } else {
                    entry.meta.checked_as_undefined = true;
                }
            }
        }
    }

    if test.requires_argument() && args.is_empty() {
        return Err(InferError::InvalidExpression {
            line,
            message: format!("`{name}` test needs an argument"),
        });
    }
    for arg in args {
        let predicted = match test {
            BuiltinTest::DivisibleBy => Structural::scalar().at(arg.line()),
            _ => Structural::unknown().at(arg.line()),
        };
        let (_, f) = visit_expr(arg, &Context::expecting(predicted), env)?;
        fragment = join(&fragment, &f, &opts)?;
    }

    Ok((Structural::scalar().at(line), fragment))
}

fn visit_call(
    callee: &Expr,
    args: &[Expr],
    kwargs: &[(String, Expr)],
    line: u32,
    ctx: &Context,
    env: &mut Env,
) -> Result<(Structural, Fragment), InferError> {
    let opts = env.opts();
    if let Expr::Name { name, .. } = callee {
        match name.as_str() {
            "range" => {
                ctx.meet(&Structural::list(Structural::unknown()), line, &opts)?;
                let mut fragment = Fragment::new();
                for arg in args {
                    let arg_ctx = Context::expecting(Structural::scalar().at(arg.line()));
                    let (_, f) = visit_expr(arg, &arg_ctx, env)?;
                    fragment = join(&fragment, &f, &opts)?;
                }
                return Ok((Structural::list(Structural::scalar()).at(line), fragment));
            }
            "lipsum" => {
                ctx.meet(&Structural::scalar(), line, &opts)?;
                let mut fragment = Fragment::new();
                for arg in args.iter().chain(kwargs.iter().map(|(_, value)| value)) {
                    let arg_ctx = Context::expecting(Structural::scalar().at(arg.line()));
                    let (_, f) = visit_expr(arg, &arg_ctx, env)?;
                    fragment = join(&fragment, &f, &opts)?;
                }
                return Ok((Structural::scalar().at(line), fragment));
            }
            "dict" => {
                ctx.meet(&Structural::empty_dictionary(), line, &opts)?;
                if !args.is_empty() {
                    return Err(InferError::InvalidExpression {
                        line,
                        message: "dict accepts only keyword arguments".to_string(),
                    });
                }
                let mut fragment = Fragment::new();
                let mut fields = BTreeMap::new();
                for (key, value) in kwargs {
                    let value_ctx = Context::expecting(Structural::unknown().at(value.line()));
                    let (value_rtype, f) = visit_expr(value, &value_ctx, env)?;
                    fragment = join(&fragment, &f, &opts)?;
                    fields.insert(key.clone(), value_rtype);
                }
                let mut rtype = Structural::dictionary(fields).at(line);
                rtype.meta.constant = true;
                return Ok((rtype, fragment));
            }
            _ => {
                if let Some(def) = env.macros.get(name.as_str()).cloned() {
                    return visit_macro_call(&def, args, kwargs, line, env);
                }
            }
        }
    }

    // An unregistered callable: scalar result, arguments unconstrained. A
    // non-name callee still contributes the shape of whatever holds it.
    let mut fragment = Fragment::new();
    if !matches!(callee, Expr::Name { .. }) {
        let callee_ctx = Context::expecting(Structural::unknown().at(callee.line()));
        let (_, f) = visit_expr(callee, &callee_ctx, env)?;
        fragment = join(&fragment, &f, &opts)?;
    }
    for arg in args.iter().chain(kwargs.iter().map(|(_, value)| value)) {
        let arg_ctx = Context::expecting(Structural::unknown().at(arg.line()));
        let (_, f) = visit_expr(arg, &arg_ctx, env)?;
        fragment = join(&fragment, &f, &opts)?;
    }
    Ok((Structural::scalar().at(line), fragment))
}

fn visit_macro_call(
    def: &MacroDef,
    args: &[Expr],
    kwargs: &[(String, Expr)],
    line: u32,
    env: &mut Env,
) -> Result<(Structural, Fragment), InferError> {
    let opts = env.opts();
    // the body's free variables are demanded again at every call site
    let mut fragment = def.free.clone();
    for (position, arg) in args.iter().enumerate() {
        let expected = def
            .positional(position)
            .map(|param| param.expected.clone())
            .unwrap_or_else(Structural::unknown);
        let (_, f) = visit_expr(arg, &Context::expecting(expected), env)?;
        fragment = join(&fragment, &f, &opts)?;
    }
    for (key, value) in kwargs {
        let expected = def
            .named(key)
            .map(|param| param.expected.clone())
            .unwrap_or_else(Structural::unknown);
        let (_, f) = visit_expr(value, &Context::expecting(expected), env)?;
        fragment = join(&fragment, &f, &opts)?;
    }
    Ok((Structural::scalar().at(line), fragment))
}

pub(crate) fn visit_body(body: &[Stmt], env: &mut Env) -> Result<Fragment, InferError> {
    let opts = env.opts();
    let mut fragment = Fragment::new();
    for stmt in body {
        let f = visit_stmt(stmt, env)?;
        fragment = join(&fragment, &f, &opts)?;
    }
    Ok(fragment)
}

pub(crate) fn visit_stmt(stmt: &Stmt, env: &mut Env) -> Result<Fragment, InferError> {
    let opts = env.opts();
    match stmt {
        Stmt::Text { .. } => Ok(Fragment::new()),

        Stmt::Output { expr, line } => {
            let ctx = Context::expecting(Structural::scalar().at(*line));
            let (_, fragment) = visit_expr(expr, &ctx, env)?;
            Ok(fragment)
        }

        Stmt::If {
            test,
            body,
            else_body,
            ..
        } => {
            let test_ctx = Context::expecting(env.condition_shape(test.line()));
            let (_, test_frag) = visit_expr(test, &test_ctx, env)?;

            let weak = env.weak_opts();
            let before = env.scope.clone();
            let body_frag = visit_body(body, env)?;
            let after_body = std::mem::replace(&mut env.scope, before.clone());
            let else_frag = visit_body(else_body, env)?;
            let after_else = std::mem::replace(&mut env.scope, before);
            env.scope = join_scopes(&after_body, &after_else, &weak)?;

            let branches = join(&body_frag, &else_frag, &opts)?;
            join(&test_frag, &branches, &opts)
        }

        Stmt::For {
            target,
            iter,
            body,
            else_body,
            line,
        } => {
            env.scope.push();
            env.scope.bind("loop", loop_variable(*line));
            let names: Vec<&str> = match target {
                Target::Name { name, .. } => vec![name.as_str()],
                Target::Tuple { names, .. } => names.iter().map(String::as_str).collect(),
            };
            for name in &names {
                env.scope.bind(
                    name.to_string(),
                    Structural::unknown().labeled(*name).at(target.line()),
                );
            }
            let body_frag = visit_body(body, env)?;
            let frame = env.scope.pop();

            let target_struct = match target {
                Target::Name { name, .. } => frame
                    .get(name.as_str())
                    .cloned()
                    .unwrap_or_else(|| Structural::unknown().at(target.line())),
                Target::Tuple { names, .. } => Structural::tuple(
                    names
                        .iter()
                        .map(|name| {
                            frame
                                .get(name.as_str())
                                .cloned()
                                .unwrap_or_else(|| Structural::unknown().at(target.line()))
                        })
                        .collect(),
                )
                .at(target.line()),
            };

            let else_frag = visit_body(else_body, env)?;

            let iter_ctx =
                Context::expecting(Structural::list(target_struct.clone()).at(*line));
            let (iter_rtype, iter_frag) = visit_expr(iter, &iter_ctx, env)?;
            merge_with(&iter_rtype, &Structural::list(target_struct), &opts)?;

            let fragment = join(&iter_frag, &body_frag, &opts)?;
            join(&fragment, &else_frag, &opts)
        }

        Stmt::Set {
            target,
            value,
            line,
        } => visit_set(target, value, *line, env),

        Stmt::SetBlock {
            name, body, line, ..
        } => {
            let fragment = visit_body(body, env)?;
            let mut bound = Structural::scalar().labeled(name.as_str()).at(*line);
            bound.meta.constant = true;
            env.scope.rebind_outer(name, bound);
            Ok(fragment)
        }

        Stmt::With {
            bindings,
            body,
            ..
        } => {
            let mut fragment = Fragment::new();
            let mut bound = Vec::new();
            for (name, value) in bindings {
                let value_ctx = Context::expecting(Structural::unknown().at(value.line()));
                let (mut rtype, f) = visit_expr(value, &value_ctx, env)?;
                rtype.meta.label = Some(name.clone());
                fragment = join(&fragment, &f, &opts)?;
                bound.push((name.clone(), rtype));
            }
            env.scope.push();
            for (name, rtype) in bound {
                env.scope.bind(name, rtype);
            }
            let body_frag = visit_body(body, env)?;
            env.scope.pop();
            join(&fragment, &body_frag, &opts)
        }

        Stmt::Macro {
            name,
            params,
            body,
            ..
        } => {
            let mut fragment = Fragment::new();
            let mut defaults = Vec::new();
            for param in params {
                let default = match &param.default {
                    Some(expr) => {
                        let default_ctx =
                            Context::expecting(Structural::unknown().at(expr.line()));
                        let (rtype, f) = visit_expr(expr, &default_ctx, env)?;
                        fragment = join(&fragment, &f, &opts)?;
                        Some(rtype)
                    }
                    None => None,
                };
                defaults.push(default);
            }

            env.scope.push();
            for (param, default) in params.iter().zip(defaults.iter()) {
                let initial = default
                    .clone()
                    .unwrap_or_else(Structural::unknown)
                    .labeled(param.name.as_str());
                env.scope.bind(param.name.clone(), initial);
            }
            env.scope.bind("varargs", Structural::list(Structural::unknown()));
            env.scope.bind("kwargs", Structural::empty_dictionary());
            env.scope.bind("caller", Structural::scalar());
            let free = visit_body(body, env)?;
            let frame = env.scope.pop();

            let shapes = params
                .iter()
                .zip(defaults)
                .map(|(param, default)| MacroParamShape {
                    name: param.name.clone(),
                    expected: frame
                        .get(param.name.as_str())
                        .cloned()
                        .unwrap_or_else(Structural::unknown),
                    default,
                })
                .collect();
            env.macros.insert(
                name.clone(),
                MacroDef {
                    name: name.clone(),
                    params: shapes,
                    free,
                },
            );
            Ok(fragment)
        }

        Stmt::FilterBlock { args, body, .. } => {
            let mut fragment = Fragment::new();
            for arg in args {
                let arg_ctx = Context::expecting(Structural::unknown().at(arg.line()));
                let (_, f) = visit_expr(arg, &arg_ctx, env)?;
                fragment = join(&fragment, &f, &opts)?;
            }
            let body_frag = visit_body(body, env)?;
            join(&fragment, &body_frag, &opts)
        }

        Stmt::Include { template, line, .. } | Stmt::Extends { template, line } => {
            match template.as_string_literal() {
                Some(path) => {
                    let path = path.to_string();
                    match load_template(&path, env)? {
                        Some(body) => {
                            env.depth += 1;
                            let result = visit_body(&body, env);
                            env.depth -= 1;
                            result
                        }
                        None => Ok(Fragment::new()),
                    }
                }
                None => {
                    let path_ctx = Context::expecting(Structural::scalar().at(*line));
                    let (_, fragment) = visit_expr(template, &path_ctx, env)?;
                    Ok(fragment)
                }
            }
        }

        Stmt::Import {
            template,
            alias,
            line,
        } => {
            let Some(exports) = load_exports(template, env)? else {
                return non_literal_path_fragment(template, *line, env);
            };
            let mut fields = BTreeMap::new();
            for name in exports.macros.keys() {
                fields.insert(name.clone(), Structural::scalar());
            }
            for (name, value) in &exports.bindings {
                fields.insert(name.clone(), value.clone());
            }
            let mut binding = Structural::dictionary(fields).labeled(alias.as_str()).at(*line);
            binding.meta.constant = true;
            env.scope.rebind_outer(alias, binding);
            Ok(Fragment::new())
        }

        Stmt::FromImport {
            template,
            names,
            line,
        } => {
            let Some(exports) = load_exports(template, env)? else {
                return non_literal_path_fragment(template, *line, env);
            };
            for (name, alias) in names {
                let local = alias.as_ref().unwrap_or(name);
                if let Some(def) = exports.macros.get(name) {
                    let mut def = def.clone();
                    def.name = local.clone();
                    env.macros.insert(local.clone(), def);
                } else {
                    let mut binding = exports
                        .bindings
                        .get(name)
                        .cloned()
                        .unwrap_or_else(|| Structural::unknown().at(*line));
                    binding.meta.label = Some(local.clone());
                    binding.meta.constant = true;
                    env.scope.rebind_outer(local, binding);
                }
            }
            Ok(Fragment::new())
        }

        Stmt::Block { body, .. } => visit_body(body, env),
    }
}

fn visit_set(
    target: &Target,
    value: &Expr,
    line: u32,
    env: &mut Env,
) -> Result<Fragment, InferError> {
    let opts = env.opts();
    match target {
        Target::Name { name, .. } => {
            let value_ctx = Context::expecting(Structural::unknown().at(value.line()));
            let (mut rtype, fragment) = visit_expr(value, &value_ctx, env)?;
            rtype.meta.constant = true;
            rtype.meta.label = Some(name.clone());
            if rtype.meta.linenos.is_empty() {
                rtype.meta.linenos = vec![line];
            }
            env.scope.rebind_outer(name, rtype);
            Ok(fragment)
        }
        Target::Tuple { names, .. } => {
            if let Expr::TupleLit { items, .. } = value {
                if items.len() != names.len() {
                    return Err(InferError::InvalidExpression {
                        line,
                        message: "number of items in left side is different from right side"
                            .to_string(),
                    });
                }
                let mut fragment = Fragment::new();
                for (name, item) in names.iter().zip(items.iter()) {
                    let item_ctx = Context::expecting(Structural::unknown().at(item.line()));
                    let (mut rtype, f) = visit_expr(item, &item_ctx, env)?;
                    rtype.meta.constant = true;
                    rtype.meta.label = Some(name.clone());
                    env.scope.rebind_outer(name, rtype);
                    fragment = join(&fragment, &f, &opts)?;
                }
                Ok(fragment)
            } else {
                let mut slots = Vec::new();
                for name in names {
                    let mut slot = Structural::unknown().labeled(name.as_str()).at(line);
                    slot.meta.constant = true;
                    env.scope.rebind_outer(name, slot.clone());
                    slots.push(slot);
                }
                let tuple_ctx = Context::expecting(Structural::tuple(slots).at(line));
                let (_, fragment) = visit_expr(value, &tuple_ctx, env)?;
                Ok(fragment)
            }
        }
    }
}

/// Join the scopes left behind by two branches. Bindings touched by only
/// one branch survive, marked optional.
fn join_scopes(a: &Scope, b: &Scope, weak: &MergeOptions) -> Result<Scope, InferError> {
    debug_assert_eq!(a.frame_count(), b.frame_count());
    let mut frames = Vec::with_capacity(a.frames.len());
    for (frame_a, frame_b) in a.frames.iter().zip(b.frames.iter()) {
        frames.push(merge_fields(frame_a, frame_b, weak)?);
    }
    Ok(Scope { frames })
}

/// The `loop` helper available inside a `for` body. All pseudo-fields are
/// scalars and none of them escape the loop frame.
fn loop_variable(line: u32) -> Structural {
    let mut fields = BTreeMap::new();
    for name in [
        "index",
        "index0",
        "revindex",
        "revindex0",
        "first",
        "last",
        "length",
        "depth",
        "depth0",
        "cycle",
        "previtem",
        "nextitem",
    ] {
        fields.insert(name.to_string(), Structural::scalar());
    }
    Structural::dictionary(fields).labeled("loop").at(line)
}

struct Exports {
    macros: BTreeMap<String, MacroDef>,
    bindings: BTreeMap<String, Structural>,
}

fn load_template(path: &str, env: &Env) -> Result<Option<Vec<Stmt>>, InferError> {
    if env.depth >= MAX_TEMPLATE_DEPTH {
        return Ok(None);
    }
    let Some(loader) = env.loader else {
        return Ok(None);
    };
    let Some(source) = loader.load(path) else {
        return Ok(None);
    };
    Ok(Some(parse(&source)?))
}

/// Macros and top-level assignments of an imported template. The imported
/// template's own free variables resolve against its own context and are
/// not propagated.
fn load_exports(template: &Expr, env: &mut Env) -> Result<Option<Exports>, InferError> {
    let Some(path) = template.as_string_literal() else {
        return Ok(None);
    };
    let path = path.to_string();
    let Some(body) = load_template(&path, env)? else {
        return Ok(Some(Exports {
            macros: BTreeMap::new(),
            bindings: BTreeMap::new(),
        }));
    };
    let mut sub = Env::new(env.config, env.loader);
    sub.depth = env.depth + 1;
    visit_body(&body, &mut sub)?;
    let bindings = sub.scope.pop();
    Ok(Some(Exports {
        macros: sub.macros,
        bindings,
    }))
}

fn non_literal_path_fragment(
    template: &Expr,
    line: u32,
    env: &mut Env,
) -> Result<Fragment, InferError> {
    let path_ctx = Context::expecting(Structural::scalar().at(line));
    let (_, fragment) = visit_expr(template, &path_ctx, env)?;
    Ok(fragment)
}

/// Infers the context shape a template source expects.
pub fn infer(source: &str, config: &Config) -> Result<Structural, InferError> {
    let body = parse(source)?;
    infer_from_ast(&body, config)
}

pub fn infer_with_loader(
    source: &str,
    config: &Config,
    loader: &dyn TemplateLoader,
) -> Result<Structural, InferError> {
    let body = parse(source)?;
    let mut env = Env::new(config, Some(loader));
    run(&body, &mut env)
}

pub fn infer_from_ast(body: &[Stmt], config: &Config) -> Result<Structural, InferError> {
    let mut env = Env::new(config, None);
    run(body, &mut env)
}

fn run(body: &[Stmt], env: &mut Env) -> Result<Structural, InferError> {
    let opts = env.opts();
    let mut fragment = visit_body(body, env)?;

    // A name assigned on some but not all paths may still have to come from
    // the context.
    let frame = env.scope.pop();
    for (name, binding) in frame {
        if binding.meta.may_be_defined {
            let mut entry = match fragment.remove(&name) {
                Some(existing) => merge_with(&existing, &binding, &opts)?,
                None => binding,
            };
            entry.meta.constant = false;
            entry.meta.may_be_defined = true;
            fragment.insert(name, entry);
        }
    }

    let mut root = Structural::dictionary(fragment);
    prune_constants(&mut root);
    Ok(root)
}

/// Drops entries that are fully determined inside the template.
fn prune_constants(shape: &mut Structural) {
    if let Kind::Dictionary(fields) = &mut shape.kind {
        fields.retain(|_, value| !(value.meta.constant && !value.meta.may_be_defined));
        for value in fields.values_mut() {
            prune_constants(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{infer, infer_with_loader, Fragment, InferError};
    use crate::jinja::config::{Config, IndexedAs};
    use crate::jinja::types::{Kind, Structural};
    use std::collections::BTreeMap;

    fn shape(source: &str) -> Structural {
        infer(source, &Config::default()).expect("inference should succeed")
    }

    fn fields(shape: &Structural) -> &Fragment {
        shape.fields().expect("top level must be a dictionary")
    }

    #[test]
    fn printed_name_is_a_required_scalar() {
        let result = shape("{{ x }}");
        let x = &fields(&result)["x"];
        assert!(matches!(x.kind, Kind::Scalar));
        assert!(x.required());
    }

    #[test]
    fn attribute_chain_builds_nested_dictionaries() {
        let result = shape("{{ x.a.b }}");
        let b = &fields(&result)["x"].fields().unwrap()["a"].fields().unwrap()["b"];
        assert!(matches!(b.kind, Kind::Scalar));
    }

    #[test]
    fn loop_variable_does_not_escape() {
        let result = shape("{% for x in xs %}{{ loop.index }}{{ x }}{% endfor %}");
        assert!(!fields(&result).contains_key("loop"));
        assert!(!fields(&result).contains_key("x"));
        assert!(fields(&result).contains_key("xs"));
    }

    #[test]
    fn loop_target_shadows_outer_binding() {
        let result = shape("{% set x = 1 %}{% for x in xs %}{{ x.a }}{% endfor %}{{ x }}");
        let xs = &fields(&result)["xs"];
        let element = xs.element().unwrap();
        assert!(element.fields().unwrap().contains_key("a"));
        // the outer assignment still hides `x` from the context
        assert!(!fields(&result).contains_key("x"));
    }

    #[test]
    fn set_binding_removes_name_from_context() {
        let result = shape("{% set greeting = 'hello' %}{{ greeting }}");
        assert!(fields(&result).is_empty());
    }

    #[test]
    fn conditional_assignment_keeps_name_optional() {
        let result = shape("{% if flag %}{% set msg = 'on' %}{% endif %}{{ msg }}");
        let msg = &fields(&result)["msg"];
        assert!(!msg.required());
    }

    #[test]
    fn defined_test_makes_name_optional() {
        let result = shape("{% if x is defined %}{{ x }}{% endif %}");
        assert!(!fields(&result)["x"].required());
    }

    #[test]
    fn with_bindings_stay_local() {
        let result = shape("{% with inner = outer.field %}{{ inner.name }}{% endwith %}");
        assert!(!fields(&result).contains_key("inner"));
        let outer = &fields(&result)["outer"];
        assert!(outer.fields().unwrap().contains_key("field"));
    }

    #[test]
    fn macro_parameters_are_inferred_from_uses_at_call_sites() {
        let result = shape(
            "{% macro line(item) %}{{ item.title }}{% endmacro %}{{ line(entry) }}",
        );
        let entry = &fields(&result)["entry"];
        assert!(entry.fields().unwrap().contains_key("title"));
    }

    #[test]
    fn uncalled_macro_contributes_nothing() {
        let result = shape("{% macro line(item) %}{{ item.title }}{{ hidden }}{% endmacro %}");
        assert!(fields(&result).is_empty());
    }

    #[test]
    fn called_macro_re_demands_its_free_variables() {
        let result =
            shape("{% macro head() %}{{ site.title }}{% endmacro %}{{ head() }}");
        assert!(fields(&result)["site"].fields().unwrap().contains_key("title"));
    }

    #[test]
    fn integer_index_follows_configuration() {
        let as_list = shape("{{ xs[0] }}");
        assert!(matches!(fields(&as_list)["xs"].kind, Kind::List(_)));

        let config = Config {
            indexed_with_integer: IndexedAs::Tuple,
            ..Config::default()
        };
        let as_tuple = infer("{{ xs[1] }}", &config).unwrap();
        let Kind::Tuple(Some(items)) = &fields(&as_tuple)["xs"].kind else {
            panic!("expected tuple");
        };
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn variable_index_defaults_to_dictionary() {
        let result = shape("{{ xs[key] }}");
        assert!(matches!(fields(&result)["xs"].kind, Kind::Dictionary(_)));
        assert!(matches!(fields(&result)["key"].kind, Kind::Scalar));
    }

    #[test]
    fn unknown_filter_degrades_to_unknown() {
        let result = shape("{{ x|sparkle }}");
        assert!(fields(&result)["x"].is_unknown());
    }

    #[test]
    fn default_filter_marks_value_optional() {
        let result = shape("{{ x|default('fallback') }}");
        assert!(!fields(&result)["x"].required());
    }

    #[test]
    fn include_merges_the_included_context() {
        let mut templates = BTreeMap::new();
        templates.insert(
            "header.html".to_string(),
            "{{ site.name }}".to_string(),
        );
        let result =
            infer_with_loader("{% include 'header.html' %}{{ page }}", &Config::default(), &templates)
                .unwrap();
        assert!(fields(&result).contains_key("site"));
        assert!(fields(&result).contains_key("page"));
    }

    #[test]
    fn missing_include_contributes_nothing() {
        let templates: BTreeMap<String, String> = BTreeMap::new();
        let result =
            infer_with_loader("{% include 'gone.html' %}{{ page }}", &Config::default(), &templates)
                .unwrap();
        assert_eq!(fields(&result).len(), 1);
    }

    #[test]
    fn from_import_binds_macros_for_typechecking() {
        let mut templates = BTreeMap::new();
        templates.insert(
            "forms.html".to_string(),
            "{% macro input(field) %}{{ field.id }}{% endmacro %}".to_string(),
        );
        let result = infer_with_loader(
            "{% from 'forms.html' import input %}{{ input(login) }}",
            &Config::default(),
            &templates,
        )
        .unwrap();
        assert!(fields(&result)["login"].fields().unwrap().contains_key("id"));
    }

    #[test]
    fn conflicting_uses_fail_with_both_lines() {
        let err = infer("{{ x }}\n{{ x.name }}", &Config::default()).unwrap_err();
        let InferError::Merge(merge) = err else {
            panic!("expected a merge failure, got {err}");
        };
        let message = merge.to_string();
        assert!(message.contains("scalar") && message.contains("dictionary"));
        assert!(message.contains('1') && message.contains('2'));
    }

    #[test]
    fn condition_only_reads_stay_required() {
        let result = shape("{% if a %}{{ b }}{% endif %}");
        assert!(fields(&result)["a"].required());
        assert!(fields(&result)["b"].required());
    }

    #[test]
    fn conditional_expression_branches_become_optional() {
        let result = shape("{{ a if c else b }}");
        assert!(!fields(&result)["a"].required());
        assert!(!fields(&result)["b"].required());
        assert!(fields(&result)["c"].required());
    }
}
