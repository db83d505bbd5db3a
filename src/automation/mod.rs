//! Column automation: card movement triggers task creation; terminal
//! task transitions route cards onward.

pub mod engine;
pub mod prompt;

pub use engine::{AutomationEngine, Outcome};
