//! FFI bindings for native apps
//!
//! A blocking `Session` object and callback interfaces, exported via uniffi
//! to Swift and Kotlin.

mod handlers;
mod session;
mod types;

pub use session::*;
pub use types::*;
