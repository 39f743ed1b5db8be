//! Numeric kernels shared by the captioning transformer.

pub mod attention;
pub mod config;
pub mod layernorm;
pub mod matmul;
pub mod utils;

pub use attention::*;
pub use config::*;
pub use layernorm::*;
pub use matmul::*;
pub use utils::*;
