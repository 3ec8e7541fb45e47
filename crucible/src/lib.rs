#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(tail_expr_drop_order)]
//! Crucible is an agent orchestration core and execution plan engine: a
//! Leader/Worker/Swarm runtime for driving a conversation through repeated
//! provider turns, tool calls, and handoffs, paired with a dependency-graph
//! engine for running permissioned, retryable, rollback-capable tool-call
//! plans underneath it.

extern crate self as crucible;

pub mod circuit;
pub mod context;
pub mod error;
pub mod events;
pub mod facade;
pub mod loop_;
pub mod message;
pub mod observability;
pub mod permission;
pub mod plan;
pub mod provider;
pub mod session;
pub mod swarm;
pub mod tool;
pub mod usage;

pub mod prelude;

#[cfg(feature = "derive")]
#[cfg_attr(docsrs, doc(cfg(feature = "derive")))]
pub use crucible_derive::tool as tool_macro;

pub use error::{EngineError, Result};
pub use facade::{EngineFacade, EngineFacadeBuilder, FacadeConfig};
