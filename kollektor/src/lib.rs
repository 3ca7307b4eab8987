//! `kollektor`: a UDP-fed event aggregator that groups `key;value`
//! datagrams into hour-rotated CSV chunk files.
//!
//! See `SPEC_FULL.md` for the module-by-module design; `DESIGN.md` for what
//! each module is grounded on.

pub mod bucket;
pub mod bucket_table;
pub mod config;
pub mod counters;
pub mod governor;
pub mod ingress;
pub mod server;
pub mod signals;
pub mod writer;
