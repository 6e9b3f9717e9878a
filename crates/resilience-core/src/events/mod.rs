//! Event layer.
//!
//! Every primitive owns an [`EventEmitter`]; emitters optionally forward to
//! a shared [`EventBus`]. Handlers registered for an exact [`EventKind`] run
//! alongside wildcard handlers, concurrently, and a failing handler never
//! affects the emitting primitive.

mod bus;
mod emitter;
mod handler;
mod types;

pub use bus::EventBus;
pub use emitter::EventEmitter;
pub use handler::{async_handler_fn, handler_fn, AsyncFnHandler, EventHandler, FnHandler};
pub use types::{Event, EventFilter, EventKind, Metadata, PatternType};
