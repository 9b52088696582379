//! Assembles a full seccomp-bpf program from a set of per-syscall rules
//! (spec §4.3): architecture gate, syscall-number dispatch, each
//! syscall's rule chain, and the policy's default action.
//!
//! A rule that fails to parse or unify is recoverable at rule
//! granularity (spec §7): it is skipped and reported back in
//! [`CompiledPolicy::errors`], while every other rule still compiles
//! into a working program. A [`CompileError`] from the emitter itself
//! is not recoverable — it means the already-normalised AST violated an
//! internal invariant, and aborts the whole compile.

use crate::ast::{Action, Expr};
use crate::bpf::{
    BpfInstr, BPF_ABS, BPF_JEQ, BPF_JMP, BPF_K, BPF_LD, BPF_RET, BPF_STMT, BPF_W,
    SECCOMP_DATA_ARCH_OFFSET, SECCOMP_DATA_NR_OFFSET, SECCOMP_RET_ALLOW, SECCOMP_RET_DATA_MASK,
    SECCOMP_RET_ERRNO, SECCOMP_RET_KILL, SECCOMP_RET_TRAP,
};
use crate::compiler::{emit_bool, CompilerContext, Target};
use crate::error::{CompileError, PolicyError, RuleError};
use crate::unifier::{unify, Env};

/// One conditional rule for a given syscall: if `expr` holds, `action`
/// is taken; otherwise the syscall's next rule (or its mismatch action)
/// is tried.
#[derive(Debug, Clone)]
pub struct Rule {
    pub expr: Expr,
    pub action: Action,
}

/// All the rules installed for one syscall number, tried in order.
#[derive(Debug, Clone)]
pub struct SyscallPolicy {
    pub nr: u32,
    pub rules: Vec<Rule>,
    /// Action taken when `nr` matches but no rule's expression holds.
    pub mismatch_action: Action,
}

/// A full seccomp policy: which architecture it's valid for, the
/// per-syscall rule sets, and the action for syscalls with no matching
/// entry at all.
#[derive(Debug, Clone)]
pub struct Policy {
    pub target_arch: u32,
    pub syscalls: Vec<SyscallPolicy>,
    pub default_action: Action,
}

/// The result of compiling a [`Policy`]: the finished program, plus any
/// rules that had to be skipped.
#[derive(Debug)]
pub struct CompiledPolicy {
    pub program: Vec<BpfInstr>,
    pub errors: PolicyError,
}

fn action_k(action: Action) -> u32 {
    match action {
        Action::Allow => SECCOMP_RET_ALLOW,
        Action::Kill => SECCOMP_RET_KILL,
        Action::Trap => SECCOMP_RET_TRAP,
        Action::Errno(n) => SECCOMP_RET_ERRNO | (n & SECCOMP_RET_DATA_MASK),
    }
}

fn emit_return(ctx: &mut CompilerContext, k: u32) {
    ctx.push(BPF_STMT(BPF_RET | BPF_K, k));
}

fn load_abs(ctx: &mut CompilerContext, offset: u32) {
    ctx.push(BPF_STMT(BPF_LD | BPF_W | BPF_ABS, offset));
}

/// One successfully unified rule, tagged with where it came from so the
/// assembly loop can find it back by `(syscall index, rule index)`.
struct UnifiedRule {
    syscall_index: usize,
    rule_index: usize,
    expr: Expr,
    action: Action,
}

/// Unifies every rule's expression against `env`, separating the ones
/// that compile cleanly from the ones reported as [`RuleError`]s.
fn unify_policy(policy: &Policy, env: &Env) -> (Vec<UnifiedRule>, Vec<RuleError>) {
    let mut good = Vec::new();
    let mut errors = Vec::new();
    for (si, sc) in policy.syscalls.iter().enumerate() {
        for (ri, rule) in sc.rules.iter().enumerate() {
            match unify(env, &rule.expr) {
                Ok(expr) => good.push(UnifiedRule {
                    syscall_index: si,
                    rule_index: ri,
                    expr,
                    action: rule.action,
                }),
                Err(source) => errors.push(RuleError::Semantic {
                    syscall: sc.nr.to_string(),
                    source,
                }),
            }
        }
    }
    (good, errors)
}

/// Compiles a full policy into a seccomp-bpf program.
#[tracing::instrument(skip(policy, env))]
pub fn compile_policy(policy: &Policy, env: &Env, max_jump_size: u16) -> Result<CompiledPolicy, CompileError> {
    let (unified, errors) = unify_policy(policy, env);

    let mut ctx = CompilerContext::new(max_jump_size);
    let kill_label = ctx.new_label();

    // Prologue: any architecture but the one this policy targets is
    // killed outright, before the syscall number is even inspected.
    load_abs(&mut ctx, SECCOMP_DATA_ARCH_OFFSET);
    ctx.emit_cond(
        BPF_JMP | BPF_JEQ | BPF_K,
        policy.target_arch,
        Target::Next,
        Target::Label(kill_label),
    );

    // Syscall dispatch: one block per syscall number, in policy order.
    // The accumulator is reloaded with the syscall number at the start
    // of every block, since the rule chain before it is free to clobber
    // it while evaluating argument expressions.
    for (si, sc) in policy.syscalls.iter().enumerate() {
        let next_syscall = ctx.new_label();
        load_abs(&mut ctx, SECCOMP_DATA_NR_OFFSET);
        ctx.emit_cond(BPF_JMP | BPF_JEQ | BPF_K, sc.nr, Target::Next, Target::Label(next_syscall));

        for ri in 0..sc.rules.len() {
            let Some(rule) = unified
                .iter()
                .find(|u| u.syscall_index == si && u.rule_index == ri)
            else {
                continue;
            };
            let action_label = ctx.new_label();
            emit_bool(&mut ctx, &rule.expr, Target::Label(action_label), Target::Next)?;
            ctx.place_label(action_label);
            emit_return(&mut ctx, action_k(rule.action));
        }
        // No rule matched this syscall.
        emit_return(&mut ctx, action_k(sc.mismatch_action));
        ctx.place_label(next_syscall);
    }

    // Every syscall not named in the policy at all falls straight
    // through the whole dispatch chain into the default action.
    emit_return(&mut ctx, action_k(policy.default_action));
    ctx.place_label(kill_label);
    emit_return(&mut ctx, SECCOMP_RET_KILL);

    let program = ctx.finish()?;
    Ok(CompiledPolicy {
        program,
        errors: PolicyError(errors),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{CompareOp, Expr};
    use crate::bpf::{BPF_JA, AUDIT_ARCH_X86_64};

    fn arg_eq(i: u8, v: u32) -> Expr {
        Expr::compare(CompareOp::Eq, Expr::Argument(i), Expr::NumericLiteral(v))
    }

    fn single_syscall(nr: u32, rules: Vec<Rule>) -> Policy {
        Policy {
            target_arch: AUDIT_ARCH_X86_64,
            syscalls: vec![SyscallPolicy {
                nr,
                rules,
                mismatch_action: Action::Kill,
            }],
            default_action: Action::Kill,
        }
    }

    #[test]
    fn unconditional_allow() {
        // write:1
        let policy = single_syscall(
            1,
            vec![Rule {
                expr: Expr::BooleanLiteral(true),
                action: Action::Allow,
            }],
        );
        let env = Env::new();
        let compiled = compile_policy(&policy, &env, 255).unwrap();
        assert!(compiled.errors.0.is_empty());
        assert!(compiled.program.iter().any(|i| i.k == SECCOMP_RET_ALLOW));
        assert!(compiled.program.iter().any(|i| i.k == SECCOMP_RET_KILL));
    }

    #[test]
    fn single_argument_comparison() {
        // read:arg0==0
        let policy = single_syscall(
            0,
            vec![Rule {
                expr: arg_eq(0, 0),
                action: Action::Allow,
            }],
        );
        let env = Env::new();
        let compiled = compile_policy(&policy, &env, 255).unwrap();
        assert!(compiled.errors.0.is_empty());
        assert!(compiled.program.iter().any(|i| i.code & 0x07 == BPF_JMP));
    }

    #[test]
    fn disjunction_of_argument_values() {
        // read:arg0==0||arg0==1
        let policy = single_syscall(
            0,
            vec![Rule {
                expr: Expr::or(arg_eq(0, 0), arg_eq(0, 1)),
                action: Action::Allow,
            }],
        );
        let env = Env::new();
        let compiled = compile_policy(&policy, &env, 255).unwrap();
        assert!(compiled.errors.0.is_empty());
        assert!(compiled.program.len() > 4);
    }

    #[test]
    fn inclusion_with_fixed_errno() {
        // openat:in(arg1,0,1,2,3); return 13
        let policy = single_syscall(
            257,
            vec![Rule {
                expr: Expr::Inclusion {
                    positive: true,
                    left: Box::new(Expr::Argument(1)),
                    rights: vec![
                        Expr::NumericLiteral(0),
                        Expr::NumericLiteral(1),
                        Expr::NumericLiteral(2),
                        Expr::NumericLiteral(3),
                    ],
                },
                action: Action::Errno(13),
            }],
        );
        let env = Env::new();
        let compiled = compile_policy(&policy, &env, 255).unwrap();
        assert!(compiled.errors.0.is_empty());
        let errno_k = SECCOMP_RET_ERRNO | 13;
        assert!(compiled.program.iter().any(|i| i.k == errno_k));
    }

    #[test]
    fn forces_long_jump_trampolines_across_many_syscalls() {
        let mut syscalls = Vec::new();
        for nr in 0..80u32 {
            syscalls.push(SyscallPolicy {
                nr,
                rules: vec![Rule {
                    expr: Expr::BooleanLiteral(true),
                    action: Action::Allow,
                }],
                mismatch_action: Action::Kill,
            });
        }
        let policy = Policy {
            target_arch: AUDIT_ARCH_X86_64,
            syscalls,
            default_action: Action::Kill,
        };
        let env = Env::new();
        let compiled = compile_policy(&policy, &env, 10).unwrap();
        assert!(compiled.errors.0.is_empty());
        let has_trampoline = compiled
            .program
            .iter()
            .any(|i| i.code & 0x07 == BPF_JMP && (i.code & 0xf0) == BPF_JA);
        assert!(has_trampoline);
        let len = compiled.program.len();
        for (idx, i) in compiled.program.iter().enumerate() {
            if i.code & 0x07 == BPF_JMP {
                if (i.code & 0xf0) == BPF_JA {
                    assert!(idx + 1 + i.k as usize <= len);
                } else {
                    assert!(idx + 1 + i.jt as usize <= len);
                    assert!(idx + 1 + i.jf as usize <= len);
                }
            }
        }
    }

    #[test]
    fn nested_de_morgan_negation() {
        // !((arg0==1)&&(arg1==2))
        let inner = Expr::and(arg_eq(0, 1), arg_eq(1, 2));
        let policy = single_syscall(
            0,
            vec![Rule {
                expr: Expr::not(inner),
                action: Action::Allow,
            }],
        );
        let env = Env::new();
        let compiled = compile_policy(&policy, &env, 255).unwrap();
        assert!(compiled.errors.0.is_empty());
        assert_eq!(compiled.program.last().unwrap().k, SECCOMP_RET_KILL);
    }

    #[test]
    fn broken_rule_is_reported_and_skipped() {
        let policy = single_syscall(
            0,
            vec![
                Rule {
                    expr: Expr::Variable("undefined".to_string()),
                    action: Action::Allow,
                },
                Rule {
                    expr: Expr::BooleanLiteral(true),
                    action: Action::Errno(1),
                },
            ],
        );
        let env = Env::new();
        let compiled = compile_policy(&policy, &env, 255).unwrap();
        assert_eq!(compiled.errors.0.len(), 1);
        assert!(compiled.program.iter().any(|i| i.k == SECCOMP_RET_ERRNO | 1));
    }
}
