//! Online user registry
//!
//! Maps display names to users, with a reverse index from session id to
//! current name. The registry is a plain owned value: the server actor is
//! its only owner, so every operation (rename included) is atomic with
//! respect to every other without a lock.

use std::collections::HashMap;

use crate::error::AppError;
use crate::types::ClientId;
use crate::user::{Mailbox, User};

/// Name → User mapping
///
/// Invariant: `users` and `names` always describe the same set of users,
/// and `names[id] == users[name].name`.
#[derive(Debug, Default)]
pub struct Registry {
    users: HashMap<String, User>,
    names: HashMap<ClientId, String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a user under its current name
    ///
    /// Returns whatever user was stored under that name before. Callers
    /// are expected to pick a free name first.
    pub fn register(&mut self, user: User) -> Option<User> {
        if let Some(stale) = self.names.remove(&user.id) {
            self.users.remove(&stale);
        }
        let previous = self.users.insert(user.name.clone(), user.clone());
        if let Some(previous) = &previous {
            self.names.remove(&previous.id);
        }
        self.names.insert(user.id, user.name);
        previous
    }

    /// Remove the user stored under `name`, if any
    pub fn unregister(&mut self, name: &str) -> Option<User> {
        let user = self.users.remove(name)?;
        self.names.remove(&user.id);
        Some(user)
    }

    /// Remove the user belonging to session `id`, if any
    pub fn unregister_client(&mut self, id: ClientId) -> Option<User> {
        let name = self.names.remove(&id)?;
        self.users.remove(&name)
    }

    pub fn lookup(&self, name: &str) -> Option<&User> {
        self.users.get(name)
    }

    pub fn get(&self, id: ClientId) -> Option<&User> {
        self.names.get(&id).and_then(|name| self.users.get(name))
    }

    pub fn name_of(&self, id: ClientId) -> Option<&str> {
        self.names.get(&id).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.users.contains_key(name)
    }

    /// All online users, in unspecified order
    pub fn snapshot(&self) -> Vec<&User> {
        self.users.values().collect()
    }

    /// Mailboxes of all online users, for broadcast fan-out
    pub fn recipients(&self) -> Vec<Mailbox> {
        self.users.values().map(|u| u.mailbox.clone()).collect()
    }

    /// Move session `id` to `new_name`
    ///
    /// Fails without touching any state if the name is empty or taken,
    /// including when it is the caller's own current name. Returns the
    /// old name on success.
    pub fn rename(&mut self, id: ClientId, new_name: &str) -> Result<String, AppError> {
        if new_name.is_empty() {
            return Err(AppError::EmptyName);
        }
        if self.users.contains_key(new_name) {
            return Err(AppError::NameInUse(new_name.to_string()));
        }

        let old_name = self.names.get(&id).cloned().ok_or(AppError::NotOnline)?;
        let mut user = self.users.remove(&old_name).ok_or(AppError::NotOnline)?;
        user.set_name(new_name.to_string());
        self.users.insert(new_name.to_string(), user);
        self.names.insert(id, new_name.to_string());

        Ok(old_name)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}
