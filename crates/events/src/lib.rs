// Direktiv events
//
// CloudEvent ingestion and correlation against listeners registered by start
// triggers and by instances waiting in consumeEvent, eventsAnd and eventsXor states.

pub mod cloudevent;
pub mod correlator;
pub mod error;
pub mod listener;

pub use cloudevent::{matches, CloudEvent};
pub use correlator::{Correlator, CorrelatorConfig, EventRecord, EventSink, EVENTS_TOPIC};
pub use error::CorrelatorError;
pub use listener::{Expired, Fired, ListenerInfo, ListenerKind, ListenerOwner, ListenerSpec};
