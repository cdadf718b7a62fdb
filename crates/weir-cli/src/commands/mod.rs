//! CLI command implementations.

pub mod common;
pub mod info;
pub mod kinds;
pub mod run;
pub mod validate;
