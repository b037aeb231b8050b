pub mod install;
pub mod keys;
pub mod manager;
pub mod tunnel;

pub use install::{InstallPlan, WireGuardAvailability};
pub use manager::VpnManager;
pub use tunnel::{TunnelBackend, TunnelError, WgQuick};

use std::sync::Arc;

use lobby_core::config::VpnConfig;

use crate::metrics::Counters;

/// A manager driving the host's `wg-quick`.
pub fn wg_quick_manager(config: VpnConfig, counters: Arc<Counters>) -> VpnManager {
    VpnManager::new(config, Arc::new(WgQuick::new()), counters)
}
