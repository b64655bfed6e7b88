use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use crate::constants::SESSION_EVENT_CAPACITY;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    Student,
    Teacher,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUser {
    pub id: Option<u64>,
    pub email: String,
    pub username: String,
    pub role: UserRole,
}

/// Who is using the editor right now. Passed explicitly to whoever needs it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionContext {
    pub user: Option<SessionUser>,
}

impl SessionContext {
    pub fn is_logged_in(&self) -> bool {
        self.user.is_some()
    }

    pub fn role(&self) -> Option<UserRole> {
        self.user.as_ref().map(|user| user.role)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    LoggedIn(SessionUser),
    LoggedOut,
}

/// Publishes login and logout to subscribers.
///
/// `watch` gives late subscribers the current context; `broadcast` gives
/// every subscriber each event in order.
#[derive(Debug)]
pub struct SessionHub {
    context: watch::Sender<SessionContext>,
    events: broadcast::Sender<SessionEvent>,
}

impl Default for SessionHub {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionHub {
    pub fn new() -> Self {
        let (context, _) = watch::channel(SessionContext::default());
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        Self { context, events }
    }

    #[tracing::instrument(skip(self), fields(username = %user.username))]
    pub fn login(&self, user: SessionUser) {
        self.context.send_replace(SessionContext {
            user: Some(user.clone()),
        });
        // No subscribers is fine.
        let _ = self.events.send(SessionEvent::LoggedIn(user));
        tracing::info!("user logged in");
    }

    /// Returns false if nobody was logged in.
    #[tracing::instrument(skip(self))]
    pub fn logout(&self) -> bool {
        let previous = self.context.send_replace(SessionContext::default());
        if !previous.is_logged_in() {
            return false;
        }
        let _ = self.events.send(SessionEvent::LoggedOut);
        tracing::info!("user logged out");
        true
    }

    pub fn current(&self) -> SessionContext {
        self.context.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionContext> {
        self.context.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn student() -> SessionUser {
        SessionUser {
            id: Some(7),
            email: "ada@example.com".to_string(),
            username: "ada".to_string(),
            role: UserRole::Student,
        }
    }

    #[tokio::test]
    async fn test_login_and_logout_are_published() {
        let hub = SessionHub::new();
        let mut events = hub.subscribe();

        hub.login(student());
        assert!(hub.logout());
        assert!(!hub.logout());

        assert_eq!(events.recv().await.unwrap(), SessionEvent::LoggedIn(student()));
        assert_eq!(events.recv().await.unwrap(), SessionEvent::LoggedOut);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_watchers_see_current_context() {
        let hub = SessionHub::new();
        let mut watcher = hub.watch();
        assert!(!watcher.borrow().is_logged_in());

        hub.login(student());
        watcher.changed().await.unwrap();

        assert_eq!(watcher.borrow().role(), Some(UserRole::Student));
        assert_eq!(hub.current().user.unwrap().username, "ada");
    }

    #[test]
    fn test_role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&UserRole::Teacher).unwrap(), "\"teacher\"");
    }
}
