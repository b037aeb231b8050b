use std::fmt;
use std::fmt::Write as _;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use zeroize::Zeroizing;

use crate::addressing::Ipv4Block;
use crate::naming::sanitize_label;

/// Base64 private key material. Wiped on drop, redacted in `Debug`, and
/// never serialized.
#[derive(Clone)]
pub struct SecretKey(Zeroizing<String>);

impl SecretKey {
    pub fn new(encoded: String) -> Self {
        Self(Zeroizing::new(encoded))
    }

    /// Borrow the encoded key. Only configuration rendering should call this.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

impl PartialEq for SecretKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_str() == other.0.as_str()
    }
}

impl Eq for SecretKey {}

/// One participant's identity within an overlay network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerConfig {
    pub user_id: String,
    pub public_key: String,
    #[serde(skip)]
    pub private_key: SecretKey,
    pub ip_address: Ipv4Addr,
    /// Overlay range this peer may reach; the whole CIDR for a full mesh.
    pub allowed_ips: String,
}

/// The host side of an overlay network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerIdentity {
    pub public_key: String,
    #[serde(skip)]
    pub private_key: SecretKey,
}

/// One overlay network provisioned for a game session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VpnSession {
    pub network_id: String,
    pub session_id: String,
    /// Order determines address assignment.
    pub participants: Vec<String>,
    pub network_cidr: Ipv4Block,
    pub server_address: Ipv4Addr,
    pub server_port: u16,
    /// Tunnel interface name on the host.
    pub interface: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    /// When the network last became (or was created) inactive.
    pub inactive_since: Option<DateTime<Utc>>,
    /// Set once the orchestration layer reports the game session over.
    pub session_ended: bool,
    pub server: ServerIdentity,
    pub peers: Vec<PeerConfig>,
}

impl VpnSession {
    pub fn peer(&self, user_id: &str) -> Option<&PeerConfig> {
        self.peers.iter().find(|p| p.user_id == user_id)
    }
}

/// Settings that shape rendered configuration files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOptions {
    pub dns: Option<String>,
    pub keepalive_secs: u16,
}

/// Render the host interface file for `wg-quick`.
pub fn render_server_config(session: &VpnSession) -> Zeroizing<String> {
    let mut out = Zeroizing::new(String::with_capacity(256 + session.peers.len() * 128));
    // Comments carry IDs only in sanitized form: wg-quick parses the whole
    // file, so a stray newline would become a directive.
    let _ = writeln!(
        out,
        "# {} (session {})",
        sanitize_label(&session.network_id),
        sanitize_label(&session.session_id)
    );
    let _ = writeln!(out, "[Interface]");
    let _ = writeln!(out, "PrivateKey = {}", session.server.private_key.expose());
    let _ = writeln!(
        out,
        "Address = {}/{}",
        session.server_address,
        session.network_cidr.prefix()
    );
    let _ = writeln!(out, "ListenPort = {}", session.server_port);

    for peer in &session.peers {
        let _ = writeln!(out);
        let _ = writeln!(out, "# {}", sanitize_label(&peer.user_id));
        let _ = writeln!(out, "[Peer]");
        let _ = writeln!(out, "PublicKey = {}", peer.public_key);
        let _ = writeln!(out, "AllowedIPs = {}/32", peer.ip_address);
    }
    out
}

/// Render one participant's client configuration.
///
/// `endpoint` is the host's externally reachable address; when it carries
/// no port the network's listen port is appended.
pub fn render_client_config(
    session: &VpnSession,
    peer: &PeerConfig,
    endpoint: &str,
    options: &RenderOptions,
) -> Zeroizing<String> {
    let endpoint = endpoint_with_port(endpoint, session.server_port);
    let mut out = Zeroizing::new(String::with_capacity(512));
    let _ = writeln!(out, "[Interface]");
    let _ = writeln!(out, "PrivateKey = {}", peer.private_key.expose());
    let _ = writeln!(
        out,
        "Address = {}/{}",
        peer.ip_address,
        session.network_cidr.prefix()
    );
    if let Some(dns) = &options.dns {
        let _ = writeln!(out, "DNS = {}", dns);
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "[Peer]");
    let _ = writeln!(out, "PublicKey = {}", session.server.public_key);
    let _ = writeln!(out, "AllowedIPs = {}", peer.allowed_ips);
    let _ = writeln!(out, "Endpoint = {}", endpoint);
    if options.keepalive_secs > 0 {
        let _ = writeln!(out, "PersistentKeepalive = {}", options.keepalive_secs);
    }
    out
}

/// Append `port` to a host endpoint unless it already carries one.
pub fn endpoint_with_port(endpoint: &str, port: u16) -> String {
    let endpoint = endpoint.trim();
    let has_port = if let Some(rest) = endpoint.strip_prefix('[') {
        rest.contains("]:")
    } else {
        endpoint.matches(':').count() == 1
    };
    if has_port {
        endpoint.to_string()
    } else if endpoint.contains(':') && !endpoint.starts_with('[') {
        format!("[{}]:{}", endpoint, port)
    } else {
        format!("{}:{}", endpoint, port)
    }
}

/// A rendered client configuration plus the metadata callers show next to it.
#[derive(Clone, Serialize)]
pub struct ClientBundle {
    pub network_id: String,
    pub user_id: String,
    /// Suggested download name (`Content-Disposition: attachment`).
    pub file_name: String,
    pub ip_address: Ipv4Addr,
    pub network_cidr: Ipv4Block,
    pub server_endpoint: String,
    pub server_public_key: String,
    #[serde(serialize_with = "serialize_secret_text")]
    pub config: Zeroizing<String>,
}

impl fmt::Debug for ClientBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBundle")
            .field("network_id", &self.network_id)
            .field("user_id", &self.user_id)
            .field("file_name", &self.file_name)
            .field("ip_address", &self.ip_address)
            .field("network_cidr", &self.network_cidr)
            .field("server_endpoint", &self.server_endpoint)
            .field("config", &"<redacted>")
            .finish()
    }
}

fn serialize_secret_text<S: Serializer>(
    text: &Zeroizing<String>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> VpnSession {
        let cidr: Ipv4Block = "10.66.3.0/29".parse().unwrap();
        VpnSession {
            network_id: "lobby-s1".to_string(),
            session_id: "s1".to_string(),
            participants: vec!["alice".to_string(), "bob".to_string()],
            network_cidr: cidr,
            server_address: Ipv4Addr::new(10, 66, 3, 1),
            server_port: 51823,
            interface: "lobby3".to_string(),
            is_active: false,
            created_at: Utc::now(),
            inactive_since: Some(Utc::now()),
            session_ended: false,
            server: ServerIdentity {
                public_key: "SERVERPUB=".to_string(),
                private_key: SecretKey::new("SERVERPRIV=".to_string()),
            },
            peers: vec![
                PeerConfig {
                    user_id: "alice".to_string(),
                    public_key: "ALICEPUB=".to_string(),
                    private_key: SecretKey::new("ALICEPRIV=".to_string()),
                    ip_address: Ipv4Addr::new(10, 66, 3, 2),
                    allowed_ips: cidr.to_string(),
                },
                PeerConfig {
                    user_id: "bob".to_string(),
                    public_key: "BOBPUB=".to_string(),
                    private_key: SecretKey::new("BOBPRIV=".to_string()),
                    ip_address: Ipv4Addr::new(10, 66, 3, 3),
                    allowed_ips: cidr.to_string(),
                },
            ],
        }
    }

    fn options() -> RenderOptions {
        RenderOptions {
            dns: Some("1.1.1.1".to_string()),
            keepalive_secs: 25,
        }
    }

    #[test]
    fn test_client_config_contents() {
        let s = session();
        let alice = s.peer("alice").unwrap();
        let text = render_client_config(&s, alice, "lobby.example.net", &options());
        assert!(text.contains("PrivateKey = ALICEPRIV="));
        assert!(text.contains("Address = 10.66.3.2/29"));
        assert!(text.contains("DNS = 1.1.1.1"));
        assert!(text.contains("PublicKey = SERVERPUB="));
        assert!(text.contains("AllowedIPs = 10.66.3.0/29"));
        assert!(text.contains("Endpoint = lobby.example.net:51823"));
        assert!(text.contains("PersistentKeepalive = 25"));
        assert!(!text.contains("BOBPRIV="));
        assert!(!text.contains("SERVERPRIV="));
    }

    #[test]
    fn test_server_config_lists_every_peer() {
        let s = session();
        let text = render_server_config(&s);
        assert!(text.contains("PrivateKey = SERVERPRIV="));
        assert!(text.contains("ListenPort = 51823"));
        assert!(text.contains("Address = 10.66.3.1/29"));
        assert_eq!(text.matches("[Peer]").count(), 2);
        assert!(text.contains("AllowedIPs = 10.66.3.2/32"));
        assert!(text.contains("AllowedIPs = 10.66.3.3/32"));
        assert!(!text.contains("ALICEPRIV="));
    }

    #[test]
    fn test_server_config_comments_cannot_inject_directives() {
        let mut s = session();
        s.session_id = "s1\nPostUp = touch /tmp/x".to_string();
        s.peers[0].user_id = "alice\r\nPostUp = id".to_string();
        let text = render_server_config(&s);
        assert!(text.lines().all(|l| !l.starts_with("PostUp")));
        assert!(text.contains("# alice__PostUp___id"));
        assert_eq!(text.matches("[Peer]").count(), 2);
    }

    #[test]
    fn test_endpoint_port_handling() {
        assert_eq!(endpoint_with_port("203.0.113.7", 51820), "203.0.113.7:51820");
        assert_eq!(endpoint_with_port("203.0.113.7:4000", 51820), "203.0.113.7:4000");
        assert_eq!(endpoint_with_port("2001:db8::1", 51820), "[2001:db8::1]:51820");
        assert_eq!(endpoint_with_port("[2001:db8::1]:9", 51820), "[2001:db8::1]:9");
        assert_eq!(endpoint_with_port("[2001:db8::1]", 51820), "[2001:db8::1]:51820");
    }

    #[test]
    fn test_private_keys_never_serialized_or_debugged() {
        let s = session();
        let json = serde_json::to_string(&s).unwrap();
        assert!(!json.contains("PRIV"));
        assert!(json.contains("ALICEPUB="));
        assert!(json.contains("\"network_cidr\":\"10.66.3.0/29\""));

        let debug = format!("{:?}", s);
        assert!(!debug.contains("PRIV"));
        assert!(debug.contains("<redacted>"));
    }
}
