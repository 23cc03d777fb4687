//! Logout fan-out.
//!
//! Resolves the user behind a removed session and calls every registered
//! [`AuthenticationListener`]. A failing or panicking listener is logged and
//! skipped; nothing propagates back to the cache that raised the removal.

use serde::Serialize;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use warden_common::{User, UserId};

use super::directory::UserDirectory;
use super::listener::{AuthenticationListener, Properties};

/// Handle returned by [`LogoutNotifier::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

type Registry = Arc<Vec<(ListenerId, Arc<dyn AuthenticationListener>)>>;

#[derive(Clone, Copy)]
enum Event {
    Login,
    Logout,
}

impl Event {
    fn as_str(self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Logout => "logout",
        }
    }
}

/// Dispatches login/logout notifications to registered listeners
pub struct LogoutNotifier {
    directory: Arc<dyn UserDirectory>,
    listeners: RwLock<Registry>,
    next_id: AtomicU64,
}

impl LogoutNotifier {
    pub fn new(directory: Arc<dyn UserDirectory>) -> Self {
        Self {
            directory,
            listeners: RwLock::new(Arc::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Add a listener; listeners are called in registration order
    pub fn register(&self, listener: Arc<dyn AuthenticationListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut guard = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = Vec::clone(&guard);
        next.push((id, listener));
        *guard = Arc::new(next);
        tracing::debug!(listener = %id, "Authentication listener registered");
        id
    }

    /// Remove a listener; returns false if it was not registered
    pub fn deregister(&self, id: ListenerId) -> bool {
        let mut guard = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        if !guard.iter().any(|(existing, _)| *existing == id) {
            return false;
        }
        let next: Vec<_> = guard
            .iter()
            .filter(|(existing, _)| *existing != id)
            .cloned()
            .collect();
        *guard = Arc::new(next);
        true
    }

    pub fn listener_count(&self) -> usize {
        self.snapshot().len()
    }

    /// Notify listeners that `user_id` logged out.
    ///
    /// Unknown users are dropped without calling any listener.
    pub fn notify(&self, user_id: UserId, properties: &Properties) {
        self.dispatch(Event::Logout, user_id, properties);
    }

    /// Notify listeners that `user_id` logged in
    pub fn notify_login(&self, user_id: UserId, properties: &Properties) {
        self.dispatch(Event::Login, user_id, properties);
    }

    fn snapshot(&self) -> Registry {
        Arc::clone(&self.listeners.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn dispatch(&self, event: Event, user_id: UserId, properties: &Properties) {
        let user = match catch_unwind(AssertUnwindSafe(|| self.directory.find_by_id(user_id))) {
            Ok(Some(user)) => user,
            Ok(None) => {
                tracing::debug!(user_id = %user_id, event = event.as_str(), "Unknown user, notification dropped");
                return;
            }
            Err(_) => {
                tracing::error!(user_id = %user_id, event = event.as_str(), "User lookup panicked");
                return;
            }
        };

        for (id, listener) in self.snapshot().iter() {
            call_isolated(*id, listener.as_ref(), event, &user, properties);
        }
    }
}

fn call_isolated(
    id: ListenerId,
    listener: &dyn AuthenticationListener,
    event: Event,
    user: &User,
    properties: &Properties,
) {
    let result = catch_unwind(AssertUnwindSafe(|| match event {
        Event::Login => listener.on_login(user, properties),
        Event::Logout => listener.on_logout(user, properties),
    }));
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::warn!(listener = %id, user_id = %user.id, event = event.as_str(), error = %e, "Authentication listener failed");
        }
        Err(_) => {
            tracing::error!(listener = %id, user_id = %user.id, event = event.as_str(), "Authentication listener panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::InMemoryUserDirectory;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        logouts: Mutex<Vec<(UserId, Properties)>>,
        logins: Mutex<Vec<UserId>>,
    }

    impl AuthenticationListener for Recording {
        fn on_login(&self, user: &User, _properties: &Properties) -> anyhow::Result<()> {
            self.logins.lock().unwrap().push(user.id);
            Ok(())
        }

        fn on_logout(&self, user: &User, properties: &Properties) -> anyhow::Result<()> {
            self.logouts.lock().unwrap().push((user.id, properties.clone()));
            Ok(())
        }
    }

    struct Failing;

    impl AuthenticationListener for Failing {
        fn on_logout(&self, _user: &User, _properties: &Properties) -> anyhow::Result<()> {
            anyhow::bail!("downstream unavailable")
        }
    }

    struct Panicking;

    impl AuthenticationListener for Panicking {
        fn on_logout(&self, _user: &User, _properties: &Properties) -> anyhow::Result<()> {
            panic!("listener bug")
        }
    }

    fn uid(id: u64) -> UserId {
        UserId::new(id).unwrap()
    }

    fn notifier_with(ids: &[u64]) -> LogoutNotifier {
        let directory = InMemoryUserDirectory::new();
        for id in ids {
            directory.insert(User::new(uid(*id), format!("user-{id}")));
        }
        LogoutNotifier::new(Arc::new(directory))
    }

    #[test]
    fn failures_do_not_stop_later_listeners() {
        let notifier = notifier_with(&[7]);
        let recording = Arc::new(Recording::default());
        notifier.register(Arc::new(Failing));
        notifier.register(Arc::new(Panicking));
        notifier.register(recording.clone());

        notifier.notify(uid(7), &Properties::new());
        assert_eq!(recording.logouts.lock().unwrap().len(), 1);
    }

    #[test]
    fn unknown_user_calls_nobody() {
        let notifier = notifier_with(&[]);
        let recording = Arc::new(Recording::default());
        notifier.register(recording.clone());

        notifier.notify(uid(9), &Properties::new());
        assert!(recording.logouts.lock().unwrap().is_empty());
    }

    #[test]
    fn deregistered_listeners_are_skipped() {
        let notifier = notifier_with(&[1]);
        let recording = Arc::new(Recording::default());
        let id = notifier.register(recording.clone());
        assert_eq!(notifier.listener_count(), 1);

        assert!(notifier.deregister(id));
        assert!(!notifier.deregister(id));
        notifier.notify(uid(1), &Properties::new());
        assert!(recording.logouts.lock().unwrap().is_empty());
    }

    #[test]
    fn login_reaches_listeners() {
        let notifier = notifier_with(&[3]);
        let recording = Arc::new(Recording::default());
        notifier.register(recording.clone());
        notifier.register(Arc::new(Failing));

        notifier.notify_login(uid(3), &Properties::new());
        assert_eq!(*recording.logins.lock().unwrap(), vec![uid(3)]);
    }

    #[test]
    fn properties_are_passed_through() {
        let notifier = notifier_with(&[4]);
        let recording = Arc::new(Recording::default());
        notifier.register(recording.clone());

        let mut properties = Properties::new();
        properties.insert("logout.cause".to_string(), "expired".to_string());
        notifier.notify(uid(4), &properties);

        let logouts = recording.logouts.lock().unwrap();
        assert_eq!(logouts[0].1.get("logout.cause").map(String::as_str), Some("expired"));
    }
}
