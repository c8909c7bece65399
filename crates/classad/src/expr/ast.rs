use std::fmt::{Display, Formatter};

use crate::ad::quote_string;

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Undefined,
    Bool(bool),
    Int(i64),
    Real(f64),
    Str(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// `=?=`: same type and same value, never undefined.
    Is,
    /// `=!=`: negation of `=?=`.
    IsNot,
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
            BinaryOp::Mod => "%",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Is => "=?=",
            BinaryOp::IsNot => "=!=",
            BinaryOp::In => "in",
            BinaryOp::NotIn => "not in",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }
}

/// Helper functions callable from expressions. Nothing outside this list can be called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    GlideinCpus,
    Int,
    Real,
    Str,
    Len,
    Lower,
    Upper,
    Split,
    Strip,
    Defined,
    IfThenElse,
    Member,
    Min,
    Max,
}

impl Function {
    pub fn lookup(name: &str) -> Option<Function> {
        let function = match name {
            "glideinCpus" => Function::GlideinCpus,
            "int" => Function::Int,
            "real" | "float" => Function::Real,
            "str" | "string" => Function::Str,
            "len" | "size" => Function::Len,
            "lower" | "toLower" => Function::Lower,
            "upper" | "toUpper" => Function::Upper,
            "split" => Function::Split,
            "strip" => Function::Strip,
            "defined" | "isDefined" => Function::Defined,
            "ifThenElse" => Function::IfThenElse,
            "member" => Function::Member,
            "min" => Function::Min,
            "max" => Function::Max,
            _ => return None,
        };
        Some(function)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Function::GlideinCpus => "glideinCpus",
            Function::Int => "int",
            Function::Real => "real",
            Function::Str => "str",
            Function::Len => "len",
            Function::Lower => "lower",
            Function::Upper => "upper",
            Function::Split => "split",
            Function::Strip => "strip",
            Function::Defined => "defined",
            Function::IfThenElse => "ifThenElse",
            Function::Member => "member",
            Function::Min => "min",
            Function::Max => "max",
        }
    }

    /// Accepted argument counts (inclusive).
    pub fn arity(&self) -> (usize, usize) {
        match self {
            Function::Split => (1, 2),
            Function::IfThenElse => (3, 3),
            Function::Member | Function::Min | Function::Max => (2, 2),
            _ => (1, 1),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal),
    Ident(String),
    List(Vec<Expr>),
    Index(Box<Expr>, Box<Expr>),
    Attr(Box<Expr>, String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Cond(Box<Expr>, Box<Expr>, Box<Expr>),
    Call(Function, Vec<Expr>),
}

impl Expr {
    /// Collects every bare identifier referenced by the expression.
    pub fn collect_identifiers(&self, output: &mut Vec<String>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Ident(name) => output.push(name.clone()),
            Expr::List(items) | Expr::Call(_, items) => {
                items.iter().for_each(|item| item.collect_identifiers(output))
            }
            Expr::Index(base, index) => {
                base.collect_identifiers(output);
                index.collect_identifiers(output);
            }
            Expr::Attr(base, _) | Expr::Unary(_, base) => base.collect_identifiers(output),
            Expr::Binary(_, lhs, rhs) => {
                lhs.collect_identifiers(output);
                rhs.collect_identifiers(output);
            }
            Expr::Cond(cond, then, otherwise) => {
                cond.collect_identifiers(output);
                then.collect_identifiers(output);
                otherwise.collect_identifiers(output);
            }
        }
    }
}

impl Expr {
    /// Collects the attribute names read from the record bound to `root`, both as
    /// `root.Name` and `root["Name"]`.
    pub fn collect_members(&self, root: &str, output: &mut Vec<String>) {
        let is_root = |base: &Expr| matches!(base, Expr::Ident(name) if name == root);
        match self {
            Expr::Literal(_) | Expr::Ident(_) => {}
            Expr::Attr(base, name) if is_root(base) => output.push(name.clone()),
            Expr::Index(base, index) if is_root(base) => match index.as_ref() {
                Expr::Literal(Literal::Str(name)) => output.push(name.clone()),
                index => index.collect_members(root, output),
            },
            Expr::List(items) | Expr::Call(_, items) => {
                items.iter().for_each(|item| item.collect_members(root, output))
            }
            Expr::Index(base, index) => {
                base.collect_members(root, output);
                index.collect_members(root, output);
            }
            Expr::Attr(base, _) | Expr::Unary(_, base) => base.collect_members(root, output),
            Expr::Binary(_, lhs, rhs) => {
                lhs.collect_members(root, output);
                rhs.collect_members(root, output);
            }
            Expr::Cond(cond, then, otherwise) => {
                cond.collect_members(root, output);
                then.collect_members(root, output);
                otherwise.collect_members(root, output);
            }
        }
    }
}

/// Prints the expression fully parenthesized, which is also valid input for the parser.
impl Display for Expr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::Literal(Literal::Undefined) => f.write_str("undefined"),
            Expr::Literal(Literal::Bool(value)) => write!(f, "{value}"),
            Expr::Literal(Literal::Int(value)) => write!(f, "{value}"),
            Expr::Literal(Literal::Real(value)) => write!(f, "{value:?}"),
            Expr::Literal(Literal::Str(value)) => f.write_str(&quote_string(value)),
            Expr::Ident(name) => f.write_str(name),
            Expr::List(items) => {
                f.write_str("[")?;
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Expr::Index(base, index) => write!(f, "{base}[{index}]"),
            Expr::Attr(base, name) => write!(f, "{base}.{name}"),
            Expr::Unary(UnaryOp::Neg, value) => write!(f, "(-{value})"),
            Expr::Unary(UnaryOp::Not, value) => write!(f, "(!{value})"),
            Expr::Binary(op, lhs, rhs) => write!(f, "({lhs} {} {rhs})", op.symbol()),
            Expr::Cond(cond, then, otherwise) => write!(f, "({cond} ? {then} : {otherwise})"),
            Expr::Call(function, args) => {
                write!(f, "{}(", function.name())?;
                for (index, arg) in args.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                f.write_str(")")
            }
        }
    }
}
