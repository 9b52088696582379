//! Normalises a raw AST before code emission (spec §4.1).
//!
//! Inlines `Variable`/`Call` references against a caller-supplied
//! [`Env`], folds constant arithmetic and comparisons (unsigned 32-bit
//! wrapping, matching BPF ALU semantics), propagates trivially constant
//! booleans, and collapses double negations. `unify` is deterministic
//! and idempotent: `unify(unify(x)) == unify(x)`.
//!
//! Divide/modulo by zero and shift counts >= 32 are left unreduced
//! rather than folded: the compiler still emits the operation and the
//! kernel's BPF verifier rejects it at load time. This is a deliberate
//! non-silence policy, not an oversight.

use std::collections::HashMap;

use crate::ast::{ArithOp, CompareOp, Expr};
use crate::error::SemanticError;

/// A reusable macro definition: formal parameter names plus a body that
/// may reference them as `Variable`s.
#[derive(Debug, Clone)]
pub struct Macro {
    pub params: Vec<String>,
    pub body: Expr,
}

/// The binding environment a policy's rules are unified against.
/// Building and populating an `Env` from policy files (includes,
/// cross-file variable bindings) is out of this compiler's scope; the
/// caller constructs one in memory.
#[derive(Debug, Clone, Default)]
pub struct Env {
    variables: HashMap<String, Expr>,
    macros: HashMap<String, Macro>,
}

impl Env {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind_variable(&mut self, name: impl Into<String>, value: Expr) -> &mut Self {
        self.variables.insert(name.into(), value);
        self
    }

    pub fn bind_macro(&mut self, name: impl Into<String>, params: Vec<String>, body: Expr) -> &mut Self {
        self.macros.insert(name.into(), Macro { params, body });
        self
    }
}

/// Normalises `expr`, which must evaluate to a boolean, against `env`.
/// This is the entry point used for a rule's top-level expression.
#[tracing::instrument(level = "debug", skip(env, expr))]
pub fn unify(env: &Env, expr: &Expr) -> Result<Expr, SemanticError> {
    unify_bool(env, expr)
}

fn unify_bool(env: &Env, expr: &Expr) -> Result<Expr, SemanticError> {
    let out = match expr {
        Expr::BooleanLiteral(b) => Expr::BooleanLiteral(*b),
        Expr::Variable(name) => {
            let bound = lookup_variable(env, name)?;
            unify_bool(env, &bound)?
        }
        Expr::Call(name, args) => {
            let body = expand_call(env, name, args)?;
            unify_bool(env, &body)?
        }
        Expr::And(l, r) => fold_and(unify_bool(env, l)?, unify_bool(env, r)?),
        Expr::Or(l, r) => fold_or(unify_bool(env, l)?, unify_bool(env, r)?),
        Expr::Negation(x) => fold_negation(unify_bool(env, x)?),
        Expr::Comparison { op, left, right } => {
            fold_comparison(*op, unify_num(env, left)?, unify_num(env, right)?)
        }
        Expr::Inclusion {
            positive,
            left,
            rights,
        } => {
            let left = unify_num(env, left)?;
            let rights = rights
                .iter()
                .map(|r| unify_num(env, r))
                .collect::<Result<Vec<_>, _>>()?;
            fold_inclusion(*positive, left, rights)
        }
        Expr::NumericLiteral(_)
        | Expr::Argument(_)
        | Expr::Arithmetic { .. }
        | Expr::BinaryNegation(_) => return Err(SemanticError::ExpectedBoolean),
    };
    Ok(out)
}

fn unify_num(env: &Env, expr: &Expr) -> Result<Expr, SemanticError> {
    let out = match expr {
        Expr::NumericLiteral(n) => Expr::NumericLiteral(*n),
        Expr::Argument(i) => {
            if *i > 5 {
                return Err(SemanticError::ArgumentOutOfRange(*i));
            }
            Expr::Argument(*i)
        }
        Expr::Variable(name) => {
            let bound = lookup_variable(env, name)?;
            unify_num(env, &bound)?
        }
        Expr::Call(name, args) => {
            let body = expand_call(env, name, args)?;
            unify_num(env, &body)?
        }
        Expr::Arithmetic { op, left, right } => {
            fold_arithmetic(*op, unify_num(env, left)?, unify_num(env, right)?)
        }
        Expr::BinaryNegation(x) => fold_binary_negation(unify_num(env, x)?),
        Expr::BooleanLiteral(_)
        | Expr::And(..)
        | Expr::Or(..)
        | Expr::Negation(_)
        | Expr::Comparison { .. }
        | Expr::Inclusion { .. } => return Err(SemanticError::ExpectedNumeric),
    };
    Ok(out)
}

fn lookup_variable(env: &Env, name: &str) -> Result<Expr, SemanticError> {
    env.variables
        .get(name)
        .cloned()
        .ok_or_else(|| SemanticError::UnknownVariable(name.to_string()))
}

fn expand_call(env: &Env, name: &str, args: &[Expr]) -> Result<Expr, SemanticError> {
    let m = env
        .macros
        .get(name)
        .ok_or_else(|| SemanticError::UnknownCall(name.to_string()))?;
    if m.params.len() != args.len() {
        return Err(SemanticError::ArityMismatch(
            name.to_string(),
            m.params.len(),
            args.len(),
        ));
    }
    let bindings: HashMap<&str, &Expr> = m
        .params
        .iter()
        .map(String::as_str)
        .zip(args.iter())
        .collect();
    Ok(substitute(&m.body, &bindings))
}

fn substitute(expr: &Expr, bindings: &HashMap<&str, &Expr>) -> Expr {
    match expr {
        Expr::Variable(name) => bindings
            .get(name.as_str())
            .map(|e| (*e).clone())
            .unwrap_or_else(|| expr.clone()),
        Expr::BooleanLiteral(_) | Expr::NumericLiteral(_) | Expr::Argument(_) => expr.clone(),
        Expr::Call(name, args) => Expr::Call(
            name.clone(),
            args.iter().map(|a| substitute(a, bindings)).collect(),
        ),
        Expr::Comparison { op, left, right } => Expr::Comparison {
            op: *op,
            left: Box::new(substitute(left, bindings)),
            right: Box::new(substitute(right, bindings)),
        },
        Expr::Arithmetic { op, left, right } => Expr::Arithmetic {
            op: *op,
            left: Box::new(substitute(left, bindings)),
            right: Box::new(substitute(right, bindings)),
        },
        Expr::BinaryNegation(x) => Expr::BinaryNegation(Box::new(substitute(x, bindings))),
        Expr::And(l, r) => Expr::and(substitute(l, bindings), substitute(r, bindings)),
        Expr::Or(l, r) => Expr::or(substitute(l, bindings), substitute(r, bindings)),
        Expr::Negation(x) => Expr::not(substitute(x, bindings)),
        Expr::Inclusion {
            positive,
            left,
            rights,
        } => Expr::Inclusion {
            positive: *positive,
            left: Box::new(substitute(left, bindings)),
            rights: rights.iter().map(|r| substitute(r, bindings)).collect(),
        },
    }
}

fn fold_and(l: Expr, r: Expr) -> Expr {
    match (l, r) {
        (Expr::BooleanLiteral(false), _) | (_, Expr::BooleanLiteral(false)) => {
            Expr::BooleanLiteral(false)
        }
        (Expr::BooleanLiteral(true), r) => r,
        (l, Expr::BooleanLiteral(true)) => l,
        (l, r) => Expr::and(l, r),
    }
}

fn fold_or(l: Expr, r: Expr) -> Expr {
    match (l, r) {
        (Expr::BooleanLiteral(true), _) | (_, Expr::BooleanLiteral(true)) => {
            Expr::BooleanLiteral(true)
        }
        (Expr::BooleanLiteral(false), r) => r,
        (l, Expr::BooleanLiteral(false)) => l,
        (l, r) => Expr::or(l, r),
    }
}

fn fold_negation(x: Expr) -> Expr {
    match x {
        Expr::BooleanLiteral(b) => Expr::BooleanLiteral(!b),
        Expr::Negation(inner) => *inner,
        x => Expr::not(x),
    }
}

fn eval_compare(op: CompareOp, l: u32, r: u32) -> bool {
    match op {
        CompareOp::Eq => l == r,
        CompareOp::Ne => l != r,
        CompareOp::Lt => l < r,
        CompareOp::Le => l <= r,
        CompareOp::Gt => l > r,
        CompareOp::Ge => l >= r,
        CompareOp::Bit => (l & r) != 0,
    }
}

fn fold_comparison(op: CompareOp, l: Expr, r: Expr) -> Expr {
    match (l, r) {
        (Expr::NumericLiteral(a), Expr::NumericLiteral(b)) => {
            Expr::BooleanLiteral(eval_compare(op, a, b))
        }
        (l, r) => Expr::compare(op, l, r),
    }
}

/// Folds a constant arithmetic operation, or returns `None` when the
/// result would require behaviour BPF itself doesn't define (divide or
/// modulo by zero, shift count >= 32) — the caller leaves the operation
/// unreduced in that case.
fn eval_arith(op: ArithOp, l: u32, r: u32) -> Option<u32> {
    match op {
        ArithOp::Add => Some(l.wrapping_add(r)),
        ArithOp::Sub => Some(l.wrapping_sub(r)),
        ArithOp::Mul => Some(l.wrapping_mul(r)),
        ArithOp::Div => l.checked_div(r),
        ArithOp::Mod => l.checked_rem(r),
        ArithOp::And => Some(l & r),
        ArithOp::Or => Some(l | r),
        ArithOp::Xor => Some(l ^ r),
        ArithOp::Shl => l.checked_shl(r),
        ArithOp::Shr => l.checked_shr(r),
    }
}

fn fold_arithmetic(op: ArithOp, l: Expr, r: Expr) -> Expr {
    match (&l, &r) {
        (Expr::NumericLiteral(a), Expr::NumericLiteral(b)) => match eval_arith(op, *a, *b) {
            Some(v) => Expr::NumericLiteral(v),
            None => Expr::arith(op, l, r),
        },
        _ => Expr::arith(op, l, r),
    }
}

fn fold_binary_negation(x: Expr) -> Expr {
    match x {
        Expr::NumericLiteral(n) => Expr::NumericLiteral(!n),
        x => Expr::BinaryNegation(Box::new(x)),
    }
}

fn fold_inclusion(positive: bool, left: Expr, rights: Vec<Expr>) -> Expr {
    if let Expr::NumericLiteral(lv) = left {
        if rights
            .iter()
            .all(|r| matches!(r, Expr::NumericLiteral(_)))
        {
            let matched = rights.iter().any(|r| matches!(r, Expr::NumericLiteral(rv) if *rv == lv));
            return Expr::BooleanLiteral(matched == positive);
        }
        return Expr::Inclusion {
            positive,
            left: Box::new(Expr::NumericLiteral(lv)),
            rights,
        };
    }
    Expr::Inclusion {
        positive,
        left: Box::new(left),
        rights,
    }
}
