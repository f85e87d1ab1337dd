//! Outbound (driven) adapters: persistence, job queue, push transports.

pub mod persistence;
pub mod push;
pub mod queue;
