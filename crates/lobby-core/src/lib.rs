// lobby-core: Pure types, state machines, policy, config
// No internal lobby dependencies and no OS calls; this is the foundation crate.

pub mod addressing;
pub mod authz;
pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod naming;
pub mod process;
pub mod vpn;
