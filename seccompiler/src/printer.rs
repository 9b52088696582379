//! Deterministic S-expression rendering of an [`Expr`], used for golden
//! tests and the printer round-trip property in spec §8.

use std::fmt::Write as _;

use crate::ast::{ArithOp, CompareOp, Expr};

fn compare_sym(op: CompareOp) -> &'static str {
    match op {
        CompareOp::Eq => "==",
        CompareOp::Ne => "!=",
        CompareOp::Lt => "<",
        CompareOp::Le => "<=",
        CompareOp::Gt => ">",
        CompareOp::Ge => ">=",
        CompareOp::Bit => "&",
    }
}

fn arith_sym(op: ArithOp) -> &'static str {
    match op {
        ArithOp::Add => "+",
        ArithOp::Sub => "-",
        ArithOp::Mul => "*",
        ArithOp::Div => "/",
        ArithOp::Mod => "%",
        ArithOp::And => "&",
        ArithOp::Or => "|",
        ArithOp::Xor => "^",
        ArithOp::Shl => "<<",
        ArithOp::Shr => ">>",
    }
}

/// Renders `expr` as a deterministic S-expression, e.g. `(== arg1 1)`.
pub fn print_expr(expr: &Expr) -> String {
    let mut out = String::new();
    write_expr(&mut out, expr);
    out
}

fn write_expr(out: &mut String, expr: &Expr) {
    match expr {
        Expr::BooleanLiteral(b) => {
            let _ = write!(out, "{b}");
        }
        Expr::NumericLiteral(n) => {
            let _ = write!(out, "{n}");
        }
        Expr::Argument(i) => {
            let _ = write!(out, "arg{i}");
        }
        Expr::Variable(name) => {
            let _ = write!(out, "{name}");
        }
        Expr::Call(name, args) => {
            let _ = write!(out, "{name}(");
            write_list(out, args);
            out.push(')');
        }
        Expr::Comparison { op, left, right } => {
            let _ = write!(out, "({} ", compare_sym(*op));
            write_expr(out, left);
            out.push(' ');
            write_expr(out, right);
            out.push(')');
        }
        Expr::Arithmetic { op, left, right } => {
            let _ = write!(out, "({} ", arith_sym(*op));
            write_expr(out, left);
            out.push(' ');
            write_expr(out, right);
            out.push(')');
        }
        Expr::BinaryNegation(x) => {
            out.push('^');
            write_expr(out, x);
        }
        Expr::And(l, r) => {
            out.push_str("(&& ");
            write_expr(out, l);
            out.push(' ');
            write_expr(out, r);
            out.push(')');
        }
        Expr::Or(l, r) => {
            out.push_str("(|| ");
            write_expr(out, l);
            out.push(' ');
            write_expr(out, r);
            out.push(')');
        }
        Expr::Negation(x) => {
            out.push('!');
            write_expr(out, x);
        }
        Expr::Inclusion {
            positive,
            left,
            rights,
        } => {
            out.push_str(if *positive { "in(" } else { "notIn(" });
            write_expr(out, left);
            if !rights.is_empty() {
                out.push_str(", ");
                write_list(out, rights);
            }
            out.push(')');
        }
    }
}

fn write_list(out: &mut String, exprs: &[Expr]) {
    for (i, e) in exprs.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        write_expr(out, e);
    }
}
