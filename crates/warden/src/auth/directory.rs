//! User lookup.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use warden_common::{User, UserId};

use crate::config::UserSeed;

/// Resolves user ids to users.
///
/// Called from cache event dispatch threads, so lookups are synchronous and
/// should be quick.
pub trait UserDirectory: Send + Sync {
    fn find_by_id(&self, id: UserId) -> Option<User>;
}

/// Directory backed by a map, seeded from configuration
#[derive(Default)]
pub struct InMemoryUserDirectory {
    users: RwLock<HashMap<UserId, User>>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from configured seeds, skipping invalid ids
    pub fn from_seeds(seeds: &[UserSeed]) -> Self {
        let directory = Self::new();
        for seed in seeds {
            let Some(id) = UserId::new(seed.id) else {
                tracing::warn!(username = %seed.username, "Skipping user with id 0");
                continue;
            };
            directory.insert(User {
                id,
                username: seed.username.clone(),
                display_name: seed.display_name.clone(),
                groups: seed.groups.clone(),
            });
        }
        directory
    }

    pub fn insert(&self, user: User) {
        self.users
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user.id, user);
    }

    pub fn remove(&self, id: UserId) -> Option<User> {
        self.users
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    pub fn len(&self) -> usize {
        self.users.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl UserDirectory for InMemoryUserDirectory {
    fn find_by_id(&self, id: UserId) -> Option<User> {
        self.users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }
}
