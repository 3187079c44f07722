//! HTTP request handlers for the TSS node.
//!
//! - `tss`: keygen and keysign, served on the TSS port
//! - `health`: ping, metrics and session inspection, served on the info port

mod health;
mod tss;

pub use health::*;
pub use tss::*;
