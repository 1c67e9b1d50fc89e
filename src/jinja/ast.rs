use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
    NotIn,
    And,
    Or,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::FloorDiv => "//",
            BinaryOp::Mod => "%",
            BinaryOp::Pow => "**",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Lte => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Gte => ">=",
            BinaryOp::In => "in",
            BinaryOp::NotIn => "not in",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
        }
    }

    pub fn is_boolean(&self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Pos,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    /// A literal string, number, boolean or none.
    Const {
        value: Value,
        line: u32,
    },
    Name {
        name: String,
        line: u32,
    },
    Getattr {
        node: Box<Expr>,
        attr: String,
        line: u32,
    },
    Getitem {
        node: Box<Expr>,
        index: Box<Expr>,
        line: u32,
    },
    Slice {
        start: Option<Box<Expr>>,
        stop: Option<Box<Expr>>,
        step: Option<Box<Expr>>,
        line: u32,
    },
    Filter {
        node: Box<Expr>,
        name: String,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
        line: u32,
    },
    Test {
        node: Box<Expr>,
        name: String,
        negated: bool,
        args: Vec<Expr>,
        line: u32,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
        line: u32,
    },
    /// `a if cond` or `a if cond else b`.
    CondExpr {
        test: Box<Expr>,
        then: Box<Expr>,
        otherwise: Option<Box<Expr>>,
        line: u32,
    },
    BinOp {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
        line: u32,
    },
    Unary {
        op: UnaryOp,
        node: Box<Expr>,
        line: u32,
    },
    /// String concatenation with `~`; flattened across chained uses.
    Concat {
        nodes: Vec<Expr>,
        line: u32,
    },
    ListLit {
        items: Vec<Expr>,
        line: u32,
    },
    TupleLit {
        items: Vec<Expr>,
        line: u32,
    },
    DictLit {
        items: Vec<(Expr, Expr)>,
        line: u32,
    },
}

impl Expr {
    pub fn line(&self) -> u32 {
        match self {
            Expr::Const { line, .. }
            | Expr::Name { line, .. }
            | Expr::Getattr { line, .. }
            | Expr::Getitem { line, .. }
            | Expr::Slice { line, .. }
            | Expr::Filter { line, .. }
            | Expr::Test { line, .. }
            | Expr::Call { line, .. }
            | Expr::CondExpr { line, .. }
            | Expr::BinOp { line, .. }
            | Expr::Unary { line, .. }
            | Expr::Concat { line, .. }
            | Expr::ListLit { line, .. }
            | Expr::TupleLit { line, .. }
            | Expr::DictLit { line, .. } => *line,
        }
    }

    pub fn constant(value: Value, line: u32) -> Expr {
        Expr::Const { value, line }
    }

    pub fn name(name: impl Into<String>, line: u32) -> Expr {
        Expr::Name {
            name: name.into(),
            line,
        }
    }

    pub fn getattr(node: Expr, attr: impl Into<String>, line: u32) -> Expr {
        Expr::Getattr {
            node: Box::new(node),
            attr: attr.into(),
            line,
        }
    }

    pub fn filter(node: Expr, name: impl Into<String>, args: Vec<Expr>, line: u32) -> Expr {
        Expr::Filter {
            node: Box::new(node),
            name: name.into(),
            args,
            kwargs: Vec::new(),
            line,
        }
    }

    /// The variable name at the root of an access chain, if the expression
    /// is a plain name or attribute path.
    pub fn root_name(&self) -> Option<&str> {
        match self {
            Expr::Name { name, .. } => Some(name),
            Expr::Getattr { node, .. } => node.root_name(),
            _ => None,
        }
    }

    pub fn as_string_literal(&self) -> Option<&str> {
        match self {
            Expr::Const {
                value: Value::String(text),
                ..
            } => Some(text),
            _ => None,
        }
    }
}

/// Assignment / loop target.
#[derive(Clone, Debug, PartialEq)]
pub enum Target {
    Name { name: String, line: u32 },
    Tuple { names: Vec<String>, line: u32 },
}

impl Target {
    pub fn line(&self) -> u32 {
        match self {
            Target::Name { line, .. } | Target::Tuple { line, .. } => *line,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MacroParam {
    pub name: String,
    pub default: Option<Expr>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Stmt {
    /// Literal template data between tags.
    Text {
        data: String,
        line: u32,
    },
    /// `{{ expr }}`
    Output {
        expr: Expr,
        line: u32,
    },
    /// `elif` chains are folded into nested `If` statements in `else_body`.
    If {
        test: Expr,
        body: Vec<Stmt>,
        else_body: Vec<Stmt>,
        line: u32,
    },
    For {
        target: Target,
        iter: Expr,
        body: Vec<Stmt>,
        else_body: Vec<Stmt>,
        line: u32,
    },
    Set {
        target: Target,
        value: Expr,
        line: u32,
    },
    /// `{% set name %}...{% endset %}`, optionally `{% set name | f %}`.
    SetBlock {
        name: String,
        filter: Option<String>,
        body: Vec<Stmt>,
        line: u32,
    },
    With {
        bindings: Vec<(String, Expr)>,
        body: Vec<Stmt>,
        line: u32,
    },
    Macro {
        name: String,
        params: Vec<MacroParam>,
        body: Vec<Stmt>,
        line: u32,
    },
    FilterBlock {
        name: String,
        args: Vec<Expr>,
        body: Vec<Stmt>,
        line: u32,
    },
    Include {
        template: Expr,
        ignore_missing: bool,
        line: u32,
    },
    Import {
        template: Expr,
        alias: String,
        line: u32,
    },
    FromImport {
        template: Expr,
        names: Vec<(String, Option<String>)>,
        line: u32,
    },
    Extends {
        template: Expr,
        line: u32,
    },
    Block {
        name: String,
        body: Vec<Stmt>,
        line: u32,
    },
}

impl Stmt {
    pub fn line(&self) -> u32 {
        match self {
            Stmt::Text { line, .. }
            | Stmt::Output { line, .. }
            | Stmt::If { line, .. }
            | Stmt::For { line, .. }
            | Stmt::Set { line, .. }
            | Stmt::SetBlock { line, .. }
            | Stmt::With { line, .. }
            | Stmt::Macro { line, .. }
            | Stmt::FilterBlock { line, .. }
            | Stmt::Include { line, .. }
            | Stmt::Import { line, .. }
            | Stmt::FromImport { line, .. }
            | Stmt::Extends { line, .. }
            | Stmt::Block { line, .. } => *line,
        }
    }
}
