use serde::{Deserialize, Serialize};

use crate::error::{LobbyError, LobbyResult};

/// The facts about a game session the managers need from the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRef {
    pub session_id: String,
    pub host_user_id: String,
}

impl SessionRef {
    pub fn new(session_id: impl Into<String>, host_user_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            host_user_id: host_user_id.into(),
        }
    }

    pub fn is_host(&self, user_id: &str) -> bool {
        self.host_user_id == user_id
    }
}

/// Host-only gate for actions such as starting or stopping a session's
/// network. The managers never call this; the request layer does, before
/// it reaches them.
pub fn authorize_host(session: &SessionRef, caller_id: &str, action: &str) -> LobbyResult<()> {
    if session.is_host(caller_id) {
        Ok(())
    } else {
        Err(LobbyError::Authorization {
            action: action.to_string(),
        })
    }
}
