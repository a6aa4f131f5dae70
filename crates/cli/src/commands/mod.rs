//! CLI command implementations

pub mod check;
pub mod fleet;
pub mod status;
