//! Request handlers.

mod websocket;

pub use websocket::*;
