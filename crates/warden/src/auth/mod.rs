//! Authentication sessions and logout notification.
//!
//! - User directory lookup
//! - Login/logout listeners and their fan-out
//! - Session cache with logout on removal

mod directory;
mod listener;
mod notifier;
mod session_cache;

pub use directory::{InMemoryUserDirectory, UserDirectory};
pub use listener::{AuthenticationListener, LoggingListener, Properties};
pub use notifier::{ListenerId, LogoutNotifier};
pub use session_cache::AuthenticationSessionCache;
