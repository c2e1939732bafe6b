// Replication Queue Kernel
//
// Per-replica queue of replicated table actions: what to fetch, merge,
// mutate or drop next, and which of those may run right now.

pub mod config;
pub mod log;
pub mod mutations;
pub mod parts;
pub mod queue;
pub mod rules;
pub mod simulate;
pub mod state;
