//! Live sessions, keyed by id.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use parley_core::profile::SessionProfile;

use crate::connector::Connector;
use crate::session::{Outbound, Session, SessionHandle};

/// Creates sessions from the current profile and forgets them once closed.
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, SessionHandle>>>,
    profile: RwLock<Arc<SessionProfile>>,
    connector: Arc<dyn Connector>,
}

impl SessionRegistry {
    pub fn new(profile: SessionProfile, connector: Arc<dyn Connector>) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            profile: RwLock::new(Arc::new(profile)),
            connector,
        }
    }

    /// Start a session for a new client. Frames for the client go to `outbound`.
    pub fn on_client_connected(&self, outbound: mpsc::UnboundedSender<Outbound>) -> SessionHandle {
        let id = Uuid::new_v4().to_string();
        let (handle, task) = Session::spawn(id.clone(), self.profile(), self.connector.clone(), outbound);
        write_map(&self.sessions).insert(id.clone(), handle.clone());
        info!(session_id = %id, live = self.len(), "Client connected");

        // a session may close on its own; forget it when its task ends
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            if let Err(e) = task.await {
                debug!(session_id = %id, error = %e, "Session task ended abnormally");
            }
            if write_map(&sessions).remove(&id).is_some() {
                debug!(session_id = %id, "Session removed");
            }
        });

        handle
    }

    /// Close and forget a session. Unknown ids are ignored.
    pub fn on_client_disconnected(&self, id: &str) {
        let removed = write_map(&self.sessions).remove(id);
        if let Some(handle) = removed {
            handle.disconnect();
            info!(session_id = %id, live = self.len(), "Client disconnected");
        }
    }

    pub fn get(&self, id: &str) -> Option<SessionHandle> {
        read_map(&self.sessions).get(id).cloned()
    }

    pub fn len(&self) -> usize {
        read_map(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The profile new sessions start with.
    pub fn profile(&self) -> Arc<SessionProfile> {
        match self.profile.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the profile for sessions created from now on. Live sessions
    /// keep the one they started with.
    pub fn swap_profile(&self, profile: SessionProfile) {
        let profile = Arc::new(profile);
        match self.profile.write() {
            Ok(mut guard) => *guard = profile,
            Err(poisoned) => *poisoned.into_inner() = profile,
        }
        info!("Session profile updated");
    }

    /// Close every live session (server shutdown).
    pub fn close_all(&self) {
        let handles: Vec<SessionHandle> = write_map(&self.sessions).drain().map(|(_, h)| h).collect();
        if !handles.is_empty() {
            info!(count = handles.len(), "Closing all sessions");
        }
        for handle in handles {
            handle.shutdown();
        }
    }
}

fn read_map(
    map: &RwLock<HashMap<String, SessionHandle>>,
) -> std::sync::RwLockReadGuard<'_, HashMap<String, SessionHandle>> {
    map.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_map(
    map: &RwLock<HashMap<String, SessionHandle>>,
) -> std::sync::RwLockWriteGuard<'_, HashMap<String, SessionHandle>> {
    map.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parley_core::config::Config;

    use super::*;
    use crate::session::SessionState;
    use crate::testing::{FakeConnector, poll};

    fn registry() -> (SessionRegistry, Arc<FakeConnector>) {
        let fake = Arc::new(FakeConnector::new());
        let registry = SessionRegistry::new(SessionProfile::from_config(Config::default()), fake.clone());
        (registry, fake)
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let (registry, _fake) = registry();
        assert!(registry.is_empty());

        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        let a = registry.on_client_connected(tx_a);
        let b = registry.on_client_connected(tx_b);
        assert_ne!(a.id(), b.id());
        assert_eq!(registry.len(), 2);

        registry.on_client_disconnected(a.id());
        registry.on_client_disconnected(a.id());
        assert_eq!(registry.len(), 1);
        assert!(registry.get(a.id()).is_none());

        let status = tokio::time::timeout(
            Duration::from_secs(3),
            a.wait_for(|s| s.state == SessionState::Closed),
        )
        .await
        .unwrap();
        assert_eq!(status.state, SessionState::Closed);
        assert!(!b.is_closed());
    }

    #[tokio::test]
    async fn test_self_closing_session_is_removed() {
        let (registry, _fake) = registry();
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = registry.on_client_connected(tx);
        assert_eq!(registry.len(), 1);

        handle.transport_error("broken pipe");
        poll(|| registry.is_empty().then_some(()), "session removal").await;
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_swap_profile_applies_to_new_sessions() {
        let (registry, _fake) = registry();
        let before = registry.profile();

        let mut config = Config::default();
        config.assistant = Some(parley_core::config::AssistantConfig {
            system_prompt: Some("Answer in one word.".into()),
            ..Default::default()
        });
        registry.swap_profile(SessionProfile::from_config(config));

        let after = registry.profile();
        assert!(!Arc::ptr_eq(&before, &after));
        assert!(after.system_prompt.starts_with("Answer in one word."));
    }

    #[tokio::test]
    async fn test_close_all() {
        let (registry, _fake) = registry();
        let mut handles = Vec::new();
        for _ in 0..3 {
            let (tx, _rx) = mpsc::unbounded_channel();
            handles.push(registry.on_client_connected(tx));
        }
        registry.close_all();
        assert!(registry.is_empty());
        for handle in handles {
            tokio::time::timeout(
                Duration::from_secs(3),
                handle.wait_for(|s| s.state == SessionState::Closed),
            )
            .await
            .unwrap();
        }
    }
}
