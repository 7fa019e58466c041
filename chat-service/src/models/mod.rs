//! Domain models for the chat service.

pub mod event;
pub mod message;
pub mod session;

pub use event::StreamEvent;
pub use message::{Message, Role};
pub use session::Session;
