//! Git CLI access used for run scoping and ground-truth checks.

mod cli;

pub use cli::GitCli;
