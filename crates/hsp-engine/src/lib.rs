//! # hsp-engine
//!
//! Host security policy enforcement core. This crate loads YAML policy
//! documents, compiles them into typed per-kind matchers, keeps the live rule
//! set in a copy-on-write index, and decides allow/block for intercepted
//! file, network and process operations.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use hsp_engine::{loader, compile, AccessEvent, DecisionEngine, DefaultPosture, FileOp, RuleIndex};
//!
//! let doc = loader::load_policy("policies/file-access.yaml").unwrap();
//! let index = Arc::new(RuleIndex::new());
//! index.add_policy(compile(&doc).unwrap()).unwrap();
//!
//! let engine = DecisionEngine::new(index, DefaultPosture::Allow);
//! let verdict = engine.decide(&AccessEvent::file("/etc/shadow", FileOp::Read));
//! println!("{:?} by {}", verdict.action, verdict.policy_name());
//! ```
//!
//! In a running host, policy changes go through a [`LifecycleHandle`] and
//! events through an [`Enforcer`], which also raises alerts.

mod alert;
mod compiler;
mod decision;
mod enforcer;
mod evaluator;
pub mod event;
mod index;
pub mod lifecycle;
pub mod loader;
pub mod matcher;
mod schema;

// Re-export primary public API at crate root.
pub use alert::{AlertEmitter, AuditMode};
pub use audit_log::{AlertAction, ResourceKind};
pub use compiler::{compile, CompileError, CompiledRule, RuleError, RuleId, RuleSet, DEFAULT_PRIORITY};
pub use decision::{DefaultPosture, ResolvedAction, RuleAction, Verdict, DEFAULT_POLICY_NAME};
pub use enforcer::Enforcer;
pub use evaluator::DecisionEngine;
pub use event::{AccessEvent, AccessPayload, EventError, FileOp, ProcessIdentity, Protocol};
pub use index::{IndexError, IndexSnapshot, RuleIndex};
pub use lifecycle::{
    ApplyOutcome, LifecycleError, LifecycleHandle, PolicyLifecycle, PolicyState, PolicyStatus,
};
pub use schema::{MatcherSpec, PolicyDocument, RuleSpec};
