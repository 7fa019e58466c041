//! Topic-guarded streaming chat service.
//!
//! A turn is guarded on the way in, streamed from the completion source,
//! guarded again on the way out, then committed to the session store and
//! the history log. See [`services::pipeline`].

pub mod config;
pub mod handlers;
pub mod models;
pub mod services;
pub mod startup;

pub use startup::AppState;
