//! CLI command implementations.
//!
//! - `tss`: keygen and keysign fan-out
//! - `info`: ping and session listing

pub mod info;
pub mod tss;

pub use info::*;
pub use tss::*;
