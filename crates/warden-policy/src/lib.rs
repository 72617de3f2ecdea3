//! Builtin policy evaluators for the warden governance layer.
//!
//! [`PolicyPack`] is a list/pattern-based evaluator covering the common
//! enforcement needs: tool allow/deny lists, approval-required operation
//! prefixes, argument size limits, secret/PII screening, and argument
//! rewrite rules. Anything richer belongs in a custom
//! [`warden_core::PolicyEvaluator`] implementation.

pub mod pack;

pub use pack::{PolicyPack, RewriteRule, ToolRules};
