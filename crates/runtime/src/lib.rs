//! Captioning runtime facade.

#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod features;
pub mod session;

#[cfg(feature = "cli")]
pub use cli::*;
pub use config::*;
pub use features::*;
pub use session::*;
