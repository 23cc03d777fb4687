//! Authentication event observers.

use anyhow::Result;
use std::collections::HashMap;

use warden_common::User;

/// Free-form properties attached to login/logout notifications
pub type Properties = HashMap<String, String>;

/// Observer of logins and logouts.
///
/// Logout callbacks run on a cache event thread. Errors and panics are
/// contained by the notifier; implementations should hand long work off to
/// their own task instead of blocking.
pub trait AuthenticationListener: Send + Sync {
    fn on_login(&self, _user: &User, _properties: &Properties) -> Result<()> {
        Ok(())
    }

    fn on_logout(&self, user: &User, properties: &Properties) -> Result<()>;
}

/// Listener that records logins and logouts in the log
pub struct LoggingListener;

impl AuthenticationListener for LoggingListener {
    fn on_login(&self, user: &User, properties: &Properties) -> Result<()> {
        tracing::info!(user_id = %user.id, username = %user.username, properties = ?properties, "User logged in");
        Ok(())
    }

    fn on_logout(&self, user: &User, properties: &Properties) -> Result<()> {
        tracing::info!(user_id = %user.id, username = %user.username, properties = ?properties, "User logged out");
        Ok(())
    }
}
