use anyhow::{Result, bail};

use crate::error::{LobbyError, LobbyResult};

/// Linux IFNAMSIZ minus the trailing NUL.
pub const MAX_INTERFACE_NAME: usize = 15;

const NETWORK_ID_PREFIX: &str = "lobby-";

/// Validate a session, user, or game ID: ASCII alphanumeric plus `-` and
/// `_`, 1-63 chars.
pub fn validate_id(id: &str, kind: &str) -> Result<()> {
    if id.is_empty() || id.len() > 63 {
        bail!("{} ID must be 1-63 characters, got {}", kind, id.len());
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        bail!(
            "{} ID must be ASCII alphanumeric, '-' or '_': {:?}",
            kind,
            id
        );
    }
    Ok(())
}

/// `validate_id` for callers that need the typed error. The offending value
/// stays out of the error text.
pub fn require_id(id: &str, kind: &'static str) -> LobbyResult<()> {
    validate_id(id, kind).map_err(|_| LobbyError::InvalidId { kind })
}

/// Reduce arbitrary text to the ID alphabet, for config comments and file
/// names. Anything else becomes `_`.
pub fn sanitize_label(text: &str) -> String {
    text.chars()
        .take(63)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Deterministic overlay network ID for a game session.
pub fn network_id(session_id: &str) -> String {
    format!("{}{}", NETWORK_ID_PREFIX, session_id)
}

/// Tunnel interface name: `<prefix><slot>`, e.g. `lobby12`.
pub fn interface_name(prefix: &str, slot: u32) -> String {
    format!("{}{}", prefix, slot)
}

/// Reject interface names the kernel would refuse.
pub fn check_interface_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_INTERFACE_NAME {
        bail!(
            "Interface name {:?} must be 1-{} characters",
            name,
            MAX_INTERFACE_NAME
        );
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        bail!("Interface name {:?} contains invalid characters", name);
    }
    Ok(())
}

/// File name offered for a client configuration download.
pub fn client_config_file_name(network_id: &str, user_id: &str) -> String {
    format!(
        "{}-{}.conf",
        sanitize_label(network_id),
        sanitize_label(user_id)
    )
}
