//! Line-oriented JSON surface of the sidecar: the router fans each request
//! out to the handler families (core, classes, gradebook, bulletins).

mod error;
mod handlers;
mod helpers;
mod router;
mod types;

pub use router::handle_request;
pub use types::{AppState, Request};
