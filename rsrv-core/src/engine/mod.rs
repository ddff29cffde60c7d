//! Abstract interface to the embedded evaluation engine (spec §6.5). The
//! engine itself is an external collaborator and explicitly out of scope
//! for this server — this module only fixes the shape `session` dispatches
//! through, plus one reference implementation used by the test suite.

pub mod reference;

pub use reference::ArithEngine;

use crate::wire::Value;

/// Outcome of [`Engine::parse`], mirroring the statuses a real parser
/// reports (spec §6.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    Null,
    Ok,
    Incomplete,
    Error,
    Eof,
}

impl ParseStatus {
    /// True for statuses that mean "try again with fewer segments" — the
    /// retry loop described in spec §4.5 "Multi-expression evaluation".
    pub fn should_retry(self) -> bool {
        matches!(self, ParseStatus::Incomplete | ParseStatus::Eof)
    }
}

pub struct ParseResult<E> {
    pub status: ParseStatus,
    pub exprs: Vec<E>,
}

/// The engine collaborator interface consumed by [`crate::session`].
///
/// A fresh `Engine` is created per connection (spec §4.7 "Isolation
/// model") so that no global binding, once made, is visible outside the
/// connection that made it.
pub trait Engine: Send {
    type Expr: Clone + Send;

    /// Parse `src` as up to `max_segments` top-level expressions.
    fn parse(&self, src: &str, max_segments: usize) -> ParseResult<Self::Expr>;

    /// Evaluate one parsed expression against the engine's global
    /// environment. `Err(code)` is a nonzero engine error code, reported
    /// on the wire as `-code` (spec §6.5, §7).
    fn try_eval(&mut self, expr: &Self::Expr) -> Result<Value, i32>;

    /// Intern `name` as an assignment target.
    fn install(&mut self, name: &str) -> Self::Expr;

    /// Bind `value` to `target` in the global environment.
    fn bind(&mut self, target: &Self::Expr, value: Value);
}
