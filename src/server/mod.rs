//! HTTP server assembly: shared state, auth seam, error-to-status
//! mapping, and the top-level router.

pub mod auth;
pub mod boards;
pub mod response;
pub mod router;
pub mod state;

pub use auth::{Authenticator, StaticTokenAuth};
pub use response::Failure;
pub use router::build_router;
pub use state::AppState;
