//! # lobbyctl: game process supervisor and WireGuard overlay manager
//!
//! Facade crate that re-exports the lobby workspace crates so consumers
//! can depend on a single `lobbyctl` library.
//!
//! ## Crate breakdown
//!
//! | Module | Crate | Purpose |
//! |--------|-------|---------|
//! | [`core`] | lobby-core | Types, state machine, health policy, addressing, config, errors |
//! | [`runtime`] | lobby-runtime | Process supervisor, `/proc` sampler, VPN manager, sweeps |
//! | [`cli`] | lobby-cli | Clap commands, logging, terminal UI |

pub use lobby_cli as cli;
pub use lobby_core as core;
pub use lobby_runtime as runtime;
