//! Process-level helpers shared by the library and the demo binaries.

pub mod bootstrap;
pub mod retry;
