//! Child-side worker runtime: the dispatch loop and builtin handlers.
//!
//! A worker executable builds a [`Registry`] (usually via
//! [`Registry::with_builtins`]), registers its own handlers, and hands it
//! to [`serve`]. See `src/bin/corral-worker.rs` for the stock worker.

pub mod builtins;
pub mod dispatcher;

pub use dispatcher::{HandlerError, HandlerResult, Registry, serve, serve_stdio};
