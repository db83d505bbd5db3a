//! In-process event fan-out: tagged event model + topic-based pub/sub.

pub mod bus;
pub mod model;

pub use bus::EventBus;
pub use model::{topic, Event};
