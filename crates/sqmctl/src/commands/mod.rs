//! Command implementations

pub mod actions;
pub mod status;
