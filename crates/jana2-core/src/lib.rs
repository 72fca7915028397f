//! Core data model of the event-processing engine: events, their
//! per-event factory sets, and the parameter-provider contract the
//! engine consumes from configuration.
//!
//! Everything here is single-threaded-per-event by construction — an
//! [`Event`](event::Event) is only ever being worked on by the one
//! worker thread currently firing an arrow against it. Cross-event and
//! cross-worker coordination lives in `jana2-topology` and
//! `jana2-engine`.

pub mod call_graph;
pub mod collection;
pub mod config;
pub mod error;
pub mod event;
pub mod factory;

pub use error::{JanaError, JanaResult};
pub use event::{Event, EventLevel, FactorySet};
pub use factory::{Factory, FactoryFlags, FactoryStatus};
