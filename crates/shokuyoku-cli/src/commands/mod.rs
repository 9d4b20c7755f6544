//! CLI subcommands.

pub mod decode;
pub mod validate;
pub mod worker;
