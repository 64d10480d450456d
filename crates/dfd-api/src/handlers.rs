//! Request handlers.

pub mod health;
pub mod predict;
pub mod predictions;

pub use health::*;
pub use predict::*;
pub use predictions::*;
