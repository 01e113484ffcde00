//! Name-keyed store of running capture sessions

use std::collections::HashMap;

/// At most one session per camera name
#[derive(Debug)]
pub struct SessionRegistry<S> {
    sessions: HashMap<String, S>,
}

impl<S> SessionRegistry<S> {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }

    /// Stores a session, handing back the one it replaced
    pub fn insert(&mut self, name: impl Into<String>, session: S) -> Option<S> {
        self.sessions.insert(name.into(), session)
    }

    pub fn remove(&mut self, name: &str) -> Option<S> {
        self.sessions.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&S> {
        self.sessions.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut S> {
        self.sessions.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sessions.contains_key(name)
    }

    /// Camera names with a session, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.keys().cloned().collect();
        names.sort();
        names
    }

    /// Empties the registry
    pub fn take_all(&mut self) -> Vec<S> {
        self.sessions.drain().map(|(_, session)| session).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl<S> Default for SessionRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}
