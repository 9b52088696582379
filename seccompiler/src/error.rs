//! Error types for all three compilation stages.
//!
//! Parse and semantic errors are reported with enough context for the
//! caller to skip the offending rule and keep compiling the rest of the
//! policy (spec §7). `CompileError` is never expected from well-typed,
//! normalised input; its variants name an internal-invariant violation
//! and are treated as fatal.

/// Byte offset of an unexpected token, for [`ParseError`] messages.
pub type Pos = usize;

/// Errors raised while tokenizing or parsing a single rule's expression.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum ParseError {
    /// unexpected token at byte {0}: '{1}'
    UnexpectedToken(Pos, String),
    /// malformed integer literal '{0}'
    MalformedLiteral(String),
    /// unbalanced parentheses
    UnbalancedParens,
    /// expected end of expression, found '{0}'
    TrailingInput(String),
    /// empty `in(...)`/`notIn(...)` argument list
    EmptyInclusionList,
    /// unexpected end of input
    UnexpectedEof,
}

/// Errors raised while the unifier normalises and type-checks an AST.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum SemanticError {
    /// unknown variable '{0}'
    UnknownVariable(String),
    /// unknown macro '{0}'
    UnknownCall(String),
    /// macro '{0}' expects {1} argument(s), got {2}
    ArityMismatch(String, usize, usize),
    /// argument index {0} is out of range (must be 0..=5)
    ArgumentOutOfRange(u8),
    /// expected a boolean expression, found a numeric one
    ExpectedBoolean,
    /// expected a numeric expression, found a boolean one
    ExpectedNumeric,
}

/// Internal-invariant violations in the emitter. Never produced by
/// well-typed, normalised input; surfacing one is a compiler bug.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum CompileError {
    /// label {0} was referenced by a jump but never placed
    UnresolvedLabel(u32),
    /// offset at instruction {0} overflowed a 32-bit unconditional jump
    OffsetOverflow(usize),
    /// instruction {0} has no valid opcode for this platform
    UnknownOpcode(usize),
}

/// A rule-level error, naming the syscall whose rule was skipped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum RuleError {
    /// rule for `{syscall}`: {source}
    Parse {
        syscall: String,
        #[source]
        source: ParseError,
    },
    /// rule for `{syscall}`: {source}
    Semantic {
        syscall: String,
        #[source]
        source: SemanticError,
    },
}

/// Top-level error returned by policy assembly (spec §4.3). Carries one
/// [`RuleError`] per defective rule; the rest of the policy may still
/// have compiled successfully (spec §7's recovery policy).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
#[displaydoc("{} rule(s) failed to compile", .0.len())]
pub struct PolicyError(pub Vec<RuleError>);
