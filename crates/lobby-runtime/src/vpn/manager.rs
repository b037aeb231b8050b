use std::collections::{BTreeSet, HashMap};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use lobby_core::addressing::{participant_capacity, plan_overlay};
use lobby_core::config::VpnConfig;
use lobby_core::error::{ActivationFailure, CapacityFailure, LobbyError, LobbyResult};
use lobby_core::naming;
use lobby_core::vpn::{
    ClientBundle, PeerConfig, RenderOptions, ServerIdentity, VpnSession, endpoint_with_port,
    render_client_config, render_server_config,
};

use super::install::{self, WireGuardAvailability};
use super::keys::generate_keypair;
use super::tunnel::{TunnelBackend, TunnelError};
use crate::metrics::Counters;

/// Owns every overlay network on this host.
///
/// Keys and addresses are fixed when a network is created and never change
/// afterwards. Tunnel tool calls run on the blocking pool with the table
/// unlocked; an in-flight transition is tracked per network so concurrent
/// start/stop calls on the same network are refused rather than interleaved.
pub struct VpnManager {
    config: VpnConfig,
    backend: Arc<dyn TunnelBackend>,
    counters: Arc<Counters>,
    table: Arc<Mutex<VpnTable>>,
}

#[derive(Default)]
struct VpnTable {
    networks: HashMap<String, NetworkEntry>,
    /// Pool slots currently held by a network.
    slots: BTreeSet<u32>,
}

struct NetworkEntry {
    session: VpnSession,
    slot: u32,
    transition: Option<Transition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Activating,
    Deactivating,
}

#[derive(Debug)]
enum UpError {
    Write(std::io::Error),
    Tunnel(TunnelError),
}

impl VpnManager {
    pub fn new(config: VpnConfig, backend: Arc<dyn TunnelBackend>, counters: Arc<Counters>) -> Self {
        Self {
            config,
            backend,
            counters,
            table: Arc::new(Mutex::new(VpnTable::default())),
        }
    }

    pub fn config(&self) -> &VpnConfig {
        &self.config
    }

    fn config_path(&self, interface: &str) -> PathBuf {
        self.config_dir().join(format!("{}.conf", interface))
    }

    fn config_dir(&self) -> &Path {
        &self.config.config_dir
    }

    fn activation_timeout(&self) -> Duration {
        Duration::from_secs(self.config.activation_timeout_secs)
    }

    /// Provision the overlay for a session, or return the existing one.
    ///
    /// Repeated calls never regenerate keys or move addresses, whatever
    /// participant list they carry. Duplicate user IDs are collapsed to
    /// their first position. Session and user IDs must pass
    /// `naming::validate_id`; nothing is allocated otherwise.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn create_vpn_network(
        &self,
        session_id: &str,
        participant_ids: &[String],
    ) -> LobbyResult<VpnSession> {
        naming::require_id(session_id, "session")?;
        if let Err(e) = participant_ids
            .iter()
            .try_for_each(|id| naming::require_id(id, "user"))
        {
            warn!("Rejected participant list with an invalid user ID");
            return Err(e);
        }

        let network_id = naming::network_id(session_id);
        let mut table = self.table.lock().await;

        if let Some(existing) = table.networks.get(&network_id) {
            debug!(network_id = %network_id, "Network already provisioned");
            return Ok(existing.session.clone());
        }

        let mut participants: Vec<String> = Vec::with_capacity(participant_ids.len());
        for id in participant_ids {
            if !participants.contains(id) {
                participants.push(id.clone());
            }
        }

        let capacity = participant_capacity(self.config.block_prefix);
        if participants.len() > capacity {
            return Err(LobbyError::Capacity(CapacityFailure::TooManyParticipants {
                requested: participants.len(),
                capacity,
            }));
        }

        let slot_count = self.config.slot_count();
        let slot = (0..slot_count)
            .find(|s| !table.slots.contains(s))
            .ok_or(LobbyError::Capacity(CapacityFailure::PoolExhausted {
                networks: table.networks.len(),
            }))?;
        let block = self
            .config
            .address_pool
            .slot(self.config.block_prefix, slot)
            .ok_or(LobbyError::Capacity(CapacityFailure::PoolExhausted {
                networks: table.networks.len(),
            }))?;
        let plan = plan_overlay(block, participants.len())?;

        // Key generation is CPU work plus getrandom; holding the lock keeps
        // concurrent creates for the same session from racing.
        let server_keys = generate_keypair();
        let allowed_ips = plan.cidr.to_string();
        let peers: Vec<PeerConfig> = participants
            .iter()
            .zip(plan.peers.iter())
            .map(|(user_id, ip)| {
                let keys = generate_keypair();
                PeerConfig {
                    user_id: user_id.clone(),
                    public_key: keys.public_key,
                    private_key: keys.private_key,
                    ip_address: *ip,
                    allowed_ips: allowed_ips.clone(),
                }
            })
            .collect();

        let now = Utc::now();
        // Config validation guarantees base_port + slot fits in a u16.
        let server_port = (u32::from(self.config.base_port) + slot) as u16;
        let session = VpnSession {
            network_id: network_id.clone(),
            session_id: session_id.to_string(),
            participants,
            network_cidr: plan.cidr,
            server_address: plan.server,
            server_port,
            interface: naming::interface_name(&self.config.interface_prefix, slot),
            is_active: false,
            created_at: now,
            inactive_since: Some(now),
            session_ended: false,
            server: ServerIdentity {
                public_key: server_keys.public_key,
                private_key: server_keys.private_key,
            },
            peers,
        };

        table.slots.insert(slot);
        table.networks.insert(
            network_id.clone(),
            NetworkEntry {
                session: session.clone(),
                slot,
                transition: None,
            },
        );
        Counters::bump(&self.counters.vpn_networks_created);
        info!(
            network_id = %network_id,
            participants = session.participants.len(),
            cidr = %session.network_cidr,
            interface = %session.interface,
            port = server_port,
            "Overlay network provisioned"
        );
        Ok(session)
    }

    /// Bring the network's interface up. No-op when already active.
    ///
    /// On any failure, including a timeout, the network stays inactive. After
    /// a timeout the network keeps refusing transitions with `Busy` until the
    /// stuck tool call returns and any interface it raised is taken down.
    #[instrument(skip_all, fields(network_id = %network_id))]
    pub async fn start_vpn_network(&self, network_id: &str) -> LobbyResult<VpnSession> {
        let (path, contents) = {
            let mut table = self.table.lock().await;
            let entry = table
                .networks
                .get_mut(network_id)
                .ok_or_else(|| LobbyError::not_found("network", network_id))?;
            if entry.session.is_active {
                return Ok(entry.session.clone());
            }
            if entry.transition.is_some() {
                return Err(LobbyError::Activation(ActivationFailure::Busy));
            }
            entry.transition = Some(Transition::Activating);
            (
                self.config_path(&entry.session.interface),
                render_server_config(&entry.session),
            )
        };

        let backend = Arc::clone(&self.backend);
        let dir = self.config_dir().to_path_buf();
        let up_path = path.clone();
        let mut handle = tokio::task::spawn_blocking(move || {
            write_private_file(&dir, &up_path, &contents).map_err(UpError::Write)?;
            backend.up(&up_path).map_err(UpError::Tunnel)
        });

        let outcome = tokio::time::timeout(self.activation_timeout(), &mut handle).await;
        let (result, stuck) = match outcome {
            Ok(Ok(Ok(()))) => (Ok(()), None),
            Ok(Ok(Err(UpError::Write(e)))) => {
                warn!(error = %e, "Could not write tunnel config");
                (Err(ActivationFailure::ConfigWrite), None)
            }
            Ok(Ok(Err(UpError::Tunnel(e)))) => {
                warn!(error = %e, "Tunnel activation failed");
                (Err(e.failure()), None)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Tunnel activation task failed");
                (Err(ActivationFailure::Rejected), None)
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.config.activation_timeout_secs,
                    "Tunnel activation timed out"
                );
                (Err(ActivationFailure::TimedOut), Some(handle))
            }
        };

        let reply = {
            let mut table = self.table.lock().await;
            match table.networks.get_mut(network_id) {
                None => Err(LobbyError::not_found("network", network_id)),
                Some(entry) => {
                    if stuck.is_none() {
                        entry.transition = None;
                    }
                    match result {
                        Ok(()) => {
                            entry.session.is_active = true;
                            entry.session.inactive_since = None;
                            Counters::bump(&self.counters.vpn_activations);
                            info!(interface = %entry.session.interface, "Overlay network active");
                            Ok(entry.session.clone())
                        }
                        Err(failure) => {
                            entry.session.is_active = false;
                            Counters::bump(&self.counters.vpn_activation_failures);
                            Err(LobbyError::Activation(failure))
                        }
                    }
                }
            }
        };

        if let Some(handle) = stuck {
            self.settle_timed_out_activation(network_id.to_string(), path, handle);
        }
        reply
    }

    /// Wait out a timed-out `up` in the background. If the tool eventually
    /// succeeds, take the interface back down; only then release the network
    /// for new transitions.
    fn settle_timed_out_activation(
        &self,
        network_id: String,
        path: PathBuf,
        handle: tokio::task::JoinHandle<Result<(), UpError>>,
    ) {
        let backend = Arc::clone(&self.backend);
        let table = Arc::clone(&self.table);
        tokio::spawn(async move {
            if let Ok(Ok(())) = handle.await {
                match tokio::task::spawn_blocking(move || backend.down(&path)).await {
                    Ok(Ok(())) => debug!(network_id = %network_id, "Late activation rolled back"),
                    Ok(Err(e)) => {
                        warn!(network_id = %network_id, error = %e, "Could not roll back late activation")
                    }
                    Err(e) => {
                        warn!(network_id = %network_id, error = %e, "Rollback task failed")
                    }
                }
            }
            let mut table = table.lock().await;
            if let Some(entry) = table.networks.get_mut(&network_id) {
                entry.transition = None;
            }
        });
    }

    /// Take the network's interface down. No-op when already inactive.
    ///
    /// Host-only in the product, but the check belongs to the caller:
    /// see `lobby_core::authz::authorize_host`.
    #[instrument(skip_all, fields(network_id = %network_id))]
    pub async fn stop_vpn_network(&self, network_id: &str) -> LobbyResult<VpnSession> {
        let path = {
            let mut table = self.table.lock().await;
            let entry = table
                .networks
                .get_mut(network_id)
                .ok_or_else(|| LobbyError::not_found("network", network_id))?;
            if !entry.session.is_active {
                return Ok(entry.session.clone());
            }
            if entry.transition.is_some() {
                return Err(LobbyError::Activation(ActivationFailure::Busy));
            }
            entry.transition = Some(Transition::Deactivating);
            self.config_path(&entry.session.interface)
        };

        let backend = Arc::clone(&self.backend);
        let handle = tokio::task::spawn_blocking(move || backend.down(&path));
        let result = match tokio::time::timeout(self.activation_timeout(), handle).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => {
                warn!(error = %e, "Tunnel deactivation failed");
                Err(e.failure())
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Tunnel deactivation task failed");
                Err(ActivationFailure::Rejected)
            }
            Err(_) => {
                warn!("Tunnel deactivation timed out");
                Err(ActivationFailure::TimedOut)
            }
        };

        let mut table = self.table.lock().await;
        let entry = table
            .networks
            .get_mut(network_id)
            .ok_or_else(|| LobbyError::not_found("network", network_id))?;
        entry.transition = None;
        match result {
            Ok(()) => {
                entry.session.is_active = false;
                entry.session.inactive_since = Some(Utc::now());
                Counters::bump(&self.counters.vpn_deactivations);
                info!(interface = %entry.session.interface, "Overlay network stopped");
                Ok(entry.session.clone())
            }
            // The interface may still be up, so it stays reported active.
            Err(failure) => Err(LobbyError::Activation(failure)),
        }
    }

    /// Render one participant's client configuration.
    ///
    /// `server_endpoint` is the host's externally reachable address; the
    /// network's listen port is appended when it carries none.
    #[instrument(skip_all, fields(network_id = %network_id, user_id = %user_id))]
    pub async fn get_client_config(
        &self,
        network_id: &str,
        user_id: &str,
        server_endpoint: &str,
    ) -> LobbyResult<ClientBundle> {
        let table = self.table.lock().await;
        let session = &table
            .networks
            .get(network_id)
            .ok_or_else(|| LobbyError::not_found("network", network_id))?
            .session;
        let peer = session
            .peer(user_id)
            .ok_or_else(|| LobbyError::not_found("participant", user_id))?;

        let options = RenderOptions {
            dns: self.config.dns().map(str::to_string),
            keepalive_secs: self.config.keepalive_secs,
        };
        let config = render_client_config(session, peer, server_endpoint, &options);
        debug!("Client config rendered");

        Ok(ClientBundle {
            network_id: session.network_id.clone(),
            user_id: peer.user_id.clone(),
            file_name: naming::client_config_file_name(&session.network_id, &peer.user_id),
            ip_address: peer.ip_address,
            network_cidr: session.network_cidr,
            server_endpoint: endpoint_with_port(server_endpoint, session.server_port),
            server_public_key: session.server.public_key.clone(),
            config,
        })
    }

    pub async fn get_vpn_session(&self, network_id: &str) -> LobbyResult<VpnSession> {
        let table = self.table.lock().await;
        table
            .networks
            .get(network_id)
            .map(|e| e.session.clone())
            .ok_or_else(|| LobbyError::not_found("network", network_id))
    }

    /// Active networks, ordered by network ID.
    pub async fn get_active_vpn_sessions(&self) -> Vec<VpnSession> {
        self.sessions_where(|s| s.is_active).await
    }

    /// Every network, ordered by network ID.
    pub async fn list_vpn_sessions(&self) -> Vec<VpnSession> {
        self.sessions_where(|_| true).await
    }

    async fn sessions_where(&self, keep: impl Fn(&VpnSession) -> bool) -> Vec<VpnSession> {
        let table = self.table.lock().await;
        let mut out: Vec<VpnSession> = table
            .networks
            .values()
            .map(|e| &e.session)
            .filter(|s| keep(*s))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.network_id.cmp(&b.network_id));
        out
    }

    /// Flag the parent game session as over so the next cleanup can reclaim
    /// the network as soon as it is inactive. Returns false when unknown.
    pub async fn mark_session_ended(&self, session_id: &str) -> bool {
        let network_id = naming::network_id(session_id);
        let mut table = self.table.lock().await;
        match table.networks.get_mut(&network_id) {
            Some(entry) => {
                entry.session.session_ended = true;
                info!(network_id = %network_id, "Game session ended");
                true
            }
            None => false,
        }
    }

    /// Drop networks whose game session ended, or that have been inactive
    /// longer than the retention window. Active networks and networks
    /// mid-transition are never touched. Returns the removed network IDs.
    pub async fn cleanup_inactive_sessions(&self) -> Vec<String> {
        let retention = Duration::from_secs(self.config.retention_secs);
        let removed: Vec<(String, PathBuf)> = {
            let mut table = self.table.lock().await;
            let now = Utc::now();
            let doomed: Vec<String> = table
                .networks
                .iter()
                .filter(|(_, e)| {
                    !e.session.is_active
                        && e.transition.is_none()
                        && (e.session.session_ended
                            || e
                                .session
                                .inactive_since
                                .is_some_and(|since| {
                                    (now - since).to_std().is_ok_and(|idle| idle >= retention)
                                }))
                })
                .map(|(id, _)| id.clone())
                .collect();

            let mut removed = Vec::with_capacity(doomed.len());
            for id in doomed {
                if let Some(entry) = table.networks.remove(&id) {
                    table.slots.remove(&entry.slot);
                    removed.push((id, self.config_path(&entry.session.interface)));
                }
            }
            removed
        };

        for (network_id, path) in &removed {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(network_id = %network_id, error = %e, "Could not remove tunnel config"),
            }
            Counters::bump(&self.counters.vpn_networks_cleaned);
            info!(network_id = %network_id, "Overlay network cleaned up");
        }
        removed.into_iter().map(|(id, _)| id).collect()
    }

    /// Probe the host's WireGuard tooling.
    pub async fn check_wireguard_availability(&self) -> WireGuardAvailability {
        match tokio::task::spawn_blocking(install::check).await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "WireGuard probe failed");
                WireGuardAvailability {
                    installed: false,
                    wg_path: None,
                    wg_quick_path: None,
                    version: None,
                    install_plan: Some(install::install_plan()),
                }
            }
        }
    }
}

/// Write `contents` to `path` readable only by us, creating `dir` (0700)
/// if needed.
fn write_private_file(dir: &Path, path: &Path, contents: &str) -> std::io::Result<()> {
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)?;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // An existing file keeps its old mode through open(); tighten it.
    file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    file.write_all(contents.as_bytes())?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lobby_core::authz::{SessionRef, authorize_host};
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingTunnel {
        calls: StdMutex<Vec<String>>,
        fail_with: Option<fn() -> TunnelError>,
    }

    impl RecordingTunnel {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, verb: &str, path: &Path) -> Result<(), TunnelError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{} {}", verb, path.display()));
            match self.fail_with {
                Some(make) => Err(make()),
                None => Ok(()),
            }
        }
    }

    impl TunnelBackend for RecordingTunnel {
        fn up(&self, config_path: &Path) -> Result<(), TunnelError> {
            self.record("up", config_path)
        }

        fn down(&self, config_path: &Path) -> Result<(), TunnelError> {
            self.record("down", config_path)
        }
    }

    struct HangingTunnel;

    impl TunnelBackend for HangingTunnel {
        fn up(&self, _config_path: &Path) -> Result<(), TunnelError> {
            std::thread::sleep(Duration::from_secs(3));
            Ok(())
        }

        fn down(&self, _config_path: &Path) -> Result<(), TunnelError> {
            Ok(())
        }
    }

    /// First `up` outlives the activation timeout; later calls return at once.
    #[derive(Default)]
    struct SlowFirstUp {
        ups: AtomicUsize,
        calls: StdMutex<Vec<String>>,
    }

    impl SlowFirstUp {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl TunnelBackend for SlowFirstUp {
        fn up(&self, _config_path: &Path) -> Result<(), TunnelError> {
            let n = self.ups.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                std::thread::sleep(Duration::from_millis(1500));
            }
            self.calls.lock().unwrap().push(format!("up#{}", n));
            Ok(())
        }

        fn down(&self, _config_path: &Path) -> Result<(), TunnelError> {
            self.calls.lock().unwrap().push("down".to_string());
            Ok(())
        }
    }

    fn config(dir: &Path) -> VpnConfig {
        VpnConfig {
            config_dir: dir.to_path_buf(),
            activation_timeout_secs: 1,
            ..VpnConfig::default()
        }
    }

    fn manager_with(dir: &Path, backend: Arc<dyn TunnelBackend>) -> VpnManager {
        VpnManager::new(config(dir), backend, Arc::new(Counters::new()))
    }

    fn users(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("user{}", i)).collect()
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager_with(dir.path(), Arc::new(RecordingTunnel::default()));
        let ids = vec!["alice".to_string(), "bob".to_string(), "carol".to_string()];

        let first = mgr.create_vpn_network("s1", &ids).await.unwrap();
        let second = mgr.create_vpn_network("s1", &ids).await.unwrap();
        assert_eq!(first.network_id, "lobby-s1");
        assert_eq!(first, second);
        for (a, b) in first.peers.iter().zip(second.peers.iter()) {
            assert_eq!(a.public_key, b.public_key);
            assert_eq!(a.ip_address, b.ip_address);
        }

        // A different participant list does not re-provision either.
        let third = mgr
            .create_vpn_network("s1", &["zed".to_string()])
            .await
            .unwrap();
        assert_eq!(third.participants, first.participants);
        assert_eq!(mgr.list_vpn_sessions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_create_rejects_ids_outside_the_alphabet() {
        let dir = tempfile::tempdir().unwrap();
        let tunnel = Arc::new(RecordingTunnel::default());
        let mgr = manager_with(dir.path(), tunnel.clone());

        let err = mgr
            .create_vpn_network("s1\nPostUp = touch /tmp/x", &["alice".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err, LobbyError::InvalidId { kind: "session" });
        assert_eq!(err.http_status(), 400);

        let err = mgr
            .create_vpn_network("s1", &["alice".to_string(), "bob\nPostUp = id".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err, LobbyError::InvalidId { kind: "user" });
        assert!(!err.to_string().contains("PostUp"));

        assert!(mgr.list_vpn_sessions().await.is_empty());
        assert_eq!(mgr.counters.snapshot().vpn_networks_created, 0);
        let ok = mgr.create_vpn_network("s1", &["alice".to_string()]).await.unwrap();
        assert_eq!(ok.interface, "lobby0");
        mgr.start_vpn_network(&ok.network_id).await.unwrap();
        let text = std::fs::read_to_string(dir.path().join("lobby0.conf")).unwrap();
        assert!(text.lines().all(|l| !l.starts_with("PostUp")));
    }

    #[tokio::test]
    async fn test_addresses_follow_participant_order() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager_with(dir.path(), Arc::new(RecordingTunnel::default()));
        let ids = vec!["bob".to_string(), "alice".to_string(), "bob".to_string()];
        let s = mgr.create_vpn_network("s1", &ids).await.unwrap();

        assert_eq!(s.participants, vec!["bob".to_string(), "alice".to_string()]);
        assert_eq!(s.network_cidr.to_string(), "10.66.0.0/29");
        assert_eq!(s.server_address.to_string(), "10.66.0.1");
        assert_eq!(s.peer("bob").unwrap().ip_address.to_string(), "10.66.0.2");
        assert_eq!(s.peer("alice").unwrap().ip_address.to_string(), "10.66.0.3");
        assert_eq!(s.peer("alice").unwrap().allowed_ips, "10.66.0.0/29");
        assert_eq!(s.server_port, 51820);
        assert_eq!(s.interface, "lobby0");
        assert!(!s.is_active);
    }

    #[tokio::test]
    async fn test_sessions_get_disjoint_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager_with(dir.path(), Arc::new(RecordingTunnel::default()));
        let a = mgr.create_vpn_network("a", &users(10)).await.unwrap();
        let b = mgr.create_vpn_network("b", &users(10)).await.unwrap();
        assert_ne!(a.interface, b.interface);
        assert_ne!(a.server_port, b.server_port);
        assert!(!a.network_cidr.contains(b.server_address));
        assert!(!b.network_cidr.contains(a.server_address));
    }

    #[tokio::test]
    async fn test_addresses_distinct_within_cidr() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager_with(dir.path(), Arc::new(RecordingTunnel::default()));
        let s = mgr.create_vpn_network("s1", &users(40)).await.unwrap();
        let mut seen = HashSet::new();
        assert!(seen.insert(s.server_address));
        for peer in &s.peers {
            assert!(seen.insert(peer.ip_address));
        }
        assert!(seen.iter().all(|ip| s.network_cidr.contains(*ip)));
        let keys: HashSet<_> = s.peers.iter().map(|p| p.public_key.clone()).collect();
        assert_eq!(keys.len(), 40);
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager_with(dir.path(), Arc::new(RecordingTunnel::default()));
        let err = mgr.create_vpn_network("s2", &users(253)).await.unwrap_err();
        assert!(matches!(
            err,
            LobbyError::Capacity(CapacityFailure::TooManyParticipants {
                requested: 253,
                capacity: 252
            })
        ));
        assert!(mgr.get_vpn_session("lobby-s2").await.is_err());

        let ok = mgr.create_vpn_network("s2", &users(252)).await.unwrap();
        assert_eq!(ok.peers.len(), 252);
        assert_eq!(ok.network_cidr.prefix(), 24);
    }

    #[tokio::test]
    async fn test_pool_exhaustion_and_slot_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = VpnConfig {
            address_pool: "10.77.0.0/23".parse().unwrap(),
            retention_secs: 0,
            ..config(dir.path())
        };
        let mgr = VpnManager::new(
            cfg,
            Arc::new(RecordingTunnel::default()),
            Arc::new(Counters::new()),
        );
        mgr.create_vpn_network("a", &users(2)).await.unwrap();
        mgr.create_vpn_network("b", &users(2)).await.unwrap();
        let err = mgr.create_vpn_network("c", &users(2)).await.unwrap_err();
        assert!(matches!(
            err,
            LobbyError::Capacity(CapacityFailure::PoolExhausted { networks: 2 })
        ));

        assert!(mgr.mark_session_ended("a").await);
        let removed = mgr.cleanup_inactive_sessions().await;
        assert_eq!(removed.len(), 2);
        let c = mgr.create_vpn_network("c", &users(2)).await.unwrap();
        assert_eq!(c.interface, "lobby0");
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let tunnel = Arc::new(RecordingTunnel::default());
        let mgr = manager_with(dir.path(), tunnel.clone());
        let s = mgr
            .create_vpn_network("s1", &["alice".to_string()])
            .await
            .unwrap();

        let started = mgr.start_vpn_network(&s.network_id).await.unwrap();
        assert!(started.is_active);
        assert!(started.inactive_since.is_none());

        let path = dir.path().join("lobby0.conf");
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains(s.server.private_key.expose()));
        assert!(text.contains(&s.peer("alice").unwrap().public_key));
        assert!(!text.contains(s.peer("alice").unwrap().private_key.expose()));
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        // Already active: no second tool call.
        mgr.start_vpn_network(&s.network_id).await.unwrap();
        assert_eq!(tunnel.calls().len(), 1);
        assert_eq!(mgr.get_active_vpn_sessions().await.len(), 1);

        let stopped = mgr.stop_vpn_network(&s.network_id).await.unwrap();
        assert!(!stopped.is_active);
        assert!(stopped.inactive_since.is_some());
        mgr.stop_vpn_network(&s.network_id).await.unwrap();
        assert_eq!(
            tunnel.calls(),
            vec![
                format!("up {}", path.display()),
                format!("down {}", path.display())
            ]
        );
        assert!(mgr.get_active_vpn_sessions().await.is_empty());

        let snap = mgr.counters.snapshot();
        assert_eq!(snap.vpn_activations, 1);
        assert_eq!(snap.vpn_deactivations, 1);
    }

    #[tokio::test]
    async fn test_start_unknown_network() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager_with(dir.path(), Arc::new(RecordingTunnel::default()));
        let err = mgr.start_vpn_network("lobby-nope").await.unwrap_err();
        assert_eq!(err.http_status(), 404);
        assert!(mgr.stop_vpn_network("lobby-nope").await.is_err());
    }

    #[tokio::test]
    async fn test_failed_start_stays_inactive() {
        let dir = tempfile::tempdir().unwrap();
        let tunnel = Arc::new(RecordingTunnel {
            fail_with: Some(|| TunnelError::ToolUnavailable {
                tool: "wg-quick".into(),
            }),
            ..RecordingTunnel::default()
        });
        let mgr = manager_with(dir.path(), tunnel);
        let s = mgr.create_vpn_network("s1", &users(2)).await.unwrap();

        let err = mgr.start_vpn_network(&s.network_id).await.unwrap_err();
        assert_eq!(
            err,
            LobbyError::Activation(ActivationFailure::ToolUnavailable)
        );
        assert_eq!(err.http_status(), 500);
        assert!(!mgr.get_vpn_session(&s.network_id).await.unwrap().is_active);
        assert_eq!(mgr.counters.snapshot().vpn_activation_failures, 1);
    }

    #[tokio::test]
    async fn test_hung_tool_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager_with(dir.path(), Arc::new(HangingTunnel));
        let s = mgr.create_vpn_network("s1", &users(2)).await.unwrap();

        let started = std::time::Instant::now();
        let err = mgr.start_vpn_network(&s.network_id).await.unwrap_err();
        assert_eq!(err, LobbyError::Activation(ActivationFailure::TimedOut));
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(!mgr.get_vpn_session(&s.network_id).await.unwrap().is_active);
    }

    #[tokio::test]
    async fn test_late_activation_is_rolled_back_before_retry() {
        let dir = tempfile::tempdir().unwrap();
        let tunnel = Arc::new(SlowFirstUp::default());
        let mgr = manager_with(dir.path(), tunnel.clone());
        let s = mgr.create_vpn_network("s1", &users(2)).await.unwrap();

        let err = mgr.start_vpn_network(&s.network_id).await.unwrap_err();
        assert_eq!(err, LobbyError::Activation(ActivationFailure::TimedOut));
        let err = mgr.start_vpn_network(&s.network_id).await.unwrap_err();
        assert_eq!(err, LobbyError::Activation(ActivationFailure::Busy));
        assert!(mgr.stop_vpn_network(&s.network_id).await.is_ok());
        assert!(mgr.cleanup_inactive_sessions().await.is_empty());

        let mut started = None;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            match mgr.start_vpn_network(&s.network_id).await {
                Err(LobbyError::Activation(ActivationFailure::Busy)) => continue,
                other => {
                    started = Some(other.unwrap());
                    break;
                }
            }
        }
        let started = started.expect("network never left the timed-out activation");
        assert!(started.is_active);
        assert_eq!(tunnel.calls(), vec!["up#0", "down", "up#1"]);
        assert!(mgr.get_vpn_session(&s.network_id).await.unwrap().is_active);
    }

    #[tokio::test]
    async fn test_config_write_failure() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        let mgr = manager_with(&blocker, Arc::new(RecordingTunnel::default()));
        let s = mgr.create_vpn_network("s1", &users(1)).await.unwrap();
        let err = mgr.start_vpn_network(&s.network_id).await.unwrap_err();
        assert_eq!(err, LobbyError::Activation(ActivationFailure::ConfigWrite));
        assert!(!err.to_string().contains("not-a-dir"));
    }

    #[tokio::test]
    async fn test_client_config_only_carries_own_key() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager_with(dir.path(), Arc::new(RecordingTunnel::default()));
        let s = mgr
            .create_vpn_network("s1", &["alice".to_string(), "bob".to_string()])
            .await
            .unwrap();

        let bundle = mgr
            .get_client_config(&s.network_id, "alice", "203.0.113.5")
            .await
            .unwrap();
        assert_eq!(bundle.file_name, "lobby-s1-alice.conf");
        assert_eq!(bundle.server_endpoint, "203.0.113.5:51820");
        assert!(bundle.config.contains(s.peer("alice").unwrap().private_key.expose()));
        assert!(!bundle.config.contains(s.peer("bob").unwrap().private_key.expose()));
        assert!(!bundle.config.contains(s.server.private_key.expose()));
        assert!(bundle.config.contains("DNS = 1.1.1.1"));
        assert!(bundle.config.contains("Endpoint = 203.0.113.5:51820"));

        let json = serde_json::to_value(&bundle).unwrap();
        assert_eq!(json["ip_address"], "10.66.0.2");
        assert_eq!(json["network_cidr"], "10.66.0.0/29");
        assert!(json["config"].as_str().unwrap().contains("[Interface]"));

        let err = mgr
            .get_client_config(&s.network_id, "mallory", "203.0.113.5")
            .await
            .unwrap_err();
        assert!(matches!(err, LobbyError::NotFound { kind: "participant", .. }));
        let err = mgr
            .get_client_config("lobby-nope", "alice", "203.0.113.5")
            .await
            .unwrap_err();
        assert!(matches!(err, LobbyError::NotFound { kind: "network", .. }));
    }

    #[tokio::test]
    async fn test_cleanup_rules() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager_with(dir.path(), Arc::new(RecordingTunnel::default()));
        let ended = mgr.create_vpn_network("ended", &users(1)).await.unwrap();
        let live = mgr.create_vpn_network("live", &users(1)).await.unwrap();
        let idle = mgr.create_vpn_network("idle", &users(1)).await.unwrap();

        mgr.start_vpn_network(&live.network_id).await.unwrap();
        mgr.start_vpn_network(&ended.network_id).await.unwrap();
        mgr.stop_vpn_network(&ended.network_id).await.unwrap();
        assert!(dir.path().join(format!("{}.conf", ended.interface)).exists());

        // Ended sessions go immediately; active ones never do, even if ended.
        assert!(mgr.mark_session_ended("ended").await);
        assert!(mgr.mark_session_ended("live").await);
        assert!(!mgr.mark_session_ended("ghost").await);
        let removed = mgr.cleanup_inactive_sessions().await;
        assert_eq!(removed, vec![ended.network_id.clone()]);
        assert!(!dir.path().join(format!("{}.conf", ended.interface)).exists());

        // Within retention, the idle network survives.
        assert!(mgr.get_vpn_session(&idle.network_id).await.is_ok());
        assert!(mgr.get_vpn_session(&live.network_id).await.unwrap().is_active);
        assert!(mgr.cleanup_inactive_sessions().await.is_empty());
    }

    #[tokio::test]
    async fn test_authorization_sits_above_the_manager() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager_with(dir.path(), Arc::new(RecordingTunnel::default()));
        let s = mgr
            .create_vpn_network("s1", &["host".to_string(), "guest".to_string()])
            .await
            .unwrap();
        mgr.start_vpn_network(&s.network_id).await.unwrap();

        // The request layer rejects the guest before the manager is reached.
        let session = SessionRef::new("s1", "host");
        let err = authorize_host(&session, "guest", "stop the network").unwrap_err();
        assert_eq!(err.http_status(), 403);
        assert!(mgr.get_vpn_session(&s.network_id).await.unwrap().is_active);

        // Called directly, the manager performs the stop regardless.
        let stopped = mgr.stop_vpn_network(&s.network_id).await.unwrap();
        assert!(!stopped.is_active);
    }
}
