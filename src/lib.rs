//! runwarden - supervised execution of multi-phase workflow plans
//!
//! An external agent does the work one step at a time; runwarden records
//! every transition in an append-only ledger, checks claimed results against
//! git/GitHub, runs lifecycle hooks and consults a knowledge base of known
//! issues when a run halts.

pub mod agent;
pub mod capability;
pub mod config;
pub mod git;
pub mod hooks;
pub mod issues;
pub mod ledger;
pub mod logging;
pub mod plan;
pub mod state;
pub mod supervisor;
pub mod verify;
