//! Session registry owned by the hub control loop.
//!
//! Three indices are kept in lockstep: the primary map, the per-user buckets
//! and the per-topic buckets. Every mutation goes through a method here so no
//! path can update one index and forget another.

use chrono::{DateTime, Utc};
use kubechat_protocol::{OutboundMessage, Topic};
use std::collections::{BTreeSet, HashMap, HashSet};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::auth::Identity;
use crate::commands::CommandHandle;

pub type SessionId = String;

/// Everything the hub knows about one connected session.
pub struct SessionEntry {
    pub id: SessionId,
    pub identity: Option<Identity>,
    pub connected_at: DateTime<Utc>,
    pub last_seen: Instant,
    pub subscriptions: BTreeSet<Topic>,
    /// In-flight commands keyed by command id.
    pub commands: HashMap<String, CommandHandle>,
    pub sender: mpsc::Sender<OutboundMessage>,
    /// Fired when the session is removed; the writer stops on it.
    pub closed: CancellationToken,
}

impl SessionEntry {
    pub fn new(
        id: SessionId,
        sender: mpsc::Sender<OutboundMessage>,
        closed: CancellationToken,
    ) -> Self {
        Self {
            id,
            identity: None,
            connected_at: Utc::now(),
            last_seen: Instant::now(),
            subscriptions: BTreeSet::new(),
            commands: HashMap::new(),
            sender,
            closed,
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        self.identity.as_ref().map(|i| i.user_id.as_str())
    }
}

#[derive(Default)]
pub struct Registry {
    sessions: HashMap<SessionId, SessionEntry>,
    by_user: HashMap<String, HashSet<SessionId>>,
    by_topic: HashMap<Topic, HashSet<SessionId>>,
}

impl Registry {
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&SessionEntry> {
        self.sessions.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut SessionEntry> {
        self.sessions.get_mut(id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &SessionEntry> {
        self.sessions.values()
    }

    /// Insert a fresh session. An existing entry with the same id is evicted
    /// first and returned.
    pub fn insert(&mut self, entry: SessionEntry) -> Option<SessionEntry> {
        let previous = self.remove(&entry.id);
        let id = entry.id.clone();
        if let Some(user_id) = entry.user_id() {
            self.by_user
                .entry(user_id.to_string())
                .or_default()
                .insert(id.clone());
        }
        for topic in &entry.subscriptions {
            self.by_topic.entry(*topic).or_default().insert(id.clone());
        }
        self.sessions.insert(id, entry);
        previous
    }

    /// Remove a session from every index. Removing an unknown id is a no-op.
    pub fn remove(&mut self, id: &str) -> Option<SessionEntry> {
        let entry = self.sessions.remove(id)?;
        if let Some(user_id) = entry.user_id() {
            remove_from_bucket(&mut self.by_user, user_id, id);
        }
        for topic in &entry.subscriptions {
            remove_from_bucket(&mut self.by_topic, topic, id);
        }
        Some(entry)
    }

    /// Attach an identity and file the session under its user.
    pub fn set_identity(&mut self, id: &str, identity: Identity) -> bool {
        let Some(entry) = self.sessions.get_mut(id) else {
            return false;
        };
        if let Some(previous) = entry.identity.take() {
            remove_from_bucket(&mut self.by_user, &previous.user_id, id);
        }
        self.by_user
            .entry(identity.user_id.clone())
            .or_default()
            .insert(id.to_string());
        entry.identity = Some(identity);
        true
    }

    pub fn subscribe(&mut self, id: &str, topics: &[Topic]) -> bool {
        let Some(entry) = self.sessions.get_mut(id) else {
            return false;
        };
        for topic in topics {
            entry.subscriptions.insert(*topic);
            self.by_topic
                .entry(*topic)
                .or_default()
                .insert(id.to_string());
        }
        true
    }

    pub fn unsubscribe(&mut self, id: &str, topics: &[Topic]) -> bool {
        let Some(entry) = self.sessions.get_mut(id) else {
            return false;
        };
        for topic in topics {
            entry.subscriptions.remove(topic);
            remove_from_bucket(&mut self.by_topic, topic, id);
        }
        true
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.keys().cloned().collect()
    }

    pub fn user_sessions(&self, user_id: &str) -> Vec<SessionId> {
        self.by_user
            .get(user_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn topic_sessions(&self, topic: Topic) -> Vec<SessionId> {
        self.by_topic
            .get(&topic)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Union of the subscribers of several topics, each session once.
    pub fn topics_sessions(&self, topics: &[Topic]) -> Vec<SessionId> {
        let mut seen = HashSet::new();
        topics
            .iter()
            .flat_map(|t| self.topic_sessions(*t))
            .filter(|id| seen.insert(id.clone()))
            .collect()
    }

    /// Cross-check the three indices. Returns a description of the first
    /// inconsistency found.
    pub fn verify_indices(&self) -> Result<(), String> {
        for (user_id, ids) in &self.by_user {
            if ids.is_empty() {
                return Err(format!("empty user bucket {}", user_id));
            }
            for id in ids {
                match self.sessions.get(id) {
                    Some(entry) if entry.user_id() == Some(user_id.as_str()) => {}
                    Some(_) => return Err(format!("session {} filed under wrong user {}", id, user_id)),
                    None => return Err(format!("dangling session {} in user {}", id, user_id)),
                }
            }
        }
        for (topic, ids) in &self.by_topic {
            if ids.is_empty() {
                return Err(format!("empty topic bucket {}", topic));
            }
            for id in ids {
                match self.sessions.get(id) {
                    Some(entry) if entry.subscriptions.contains(topic) => {}
                    Some(_) => return Err(format!("session {} not subscribed to {}", id, topic)),
                    None => return Err(format!("dangling session {} in topic {}", id, topic)),
                }
            }
        }
        for (id, entry) in &self.sessions {
            if let Some(user_id) = entry.user_id() {
                if !self.by_user.get(user_id).is_some_and(|ids| ids.contains(id)) {
                    return Err(format!("session {} missing from user {}", id, user_id));
                }
            }
            for topic in &entry.subscriptions {
                if !self.by_topic.get(topic).is_some_and(|ids| ids.contains(id)) {
                    return Err(format!("session {} missing from topic {}", id, topic));
                }
            }
        }
        Ok(())
    }
}

fn remove_from_bucket<K, Q>(index: &mut HashMap<K, HashSet<SessionId>>, key: &Q, id: &str)
where
    K: std::borrow::Borrow<Q> + std::hash::Hash + Eq,
    Q: std::hash::Hash + Eq + ?Sized,
{
    let now_empty = match index.get_mut(key) {
        Some(ids) => {
            ids.remove(id);
            ids.is_empty()
        }
        None => false,
    };
    if now_empty {
        index.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;

    fn entry(id: &str) -> SessionEntry {
        let (tx, _rx) = mpsc::channel(4);
        SessionEntry::new(id.to_string(), tx, CancellationToken::new())
    }

    fn identity(user: &str) -> Identity {
        Identity {
            user_id: user.to_string(),
            username: user.to_string(),
            role: Role::User,
            session_scope_id: format!("scope-{}", user),
        }
    }

    #[test]
    fn test_remove_clears_every_index() {
        let mut registry = Registry::default();
        registry.insert(entry("a"));
        registry.insert(entry("b"));
        assert!(registry.set_identity("a", identity("alice")));
        assert!(registry.set_identity("b", identity("alice")));
        registry.subscribe("a", &[Topic::Commands, Topic::Alerts]);
        registry.subscribe("b", &[Topic::Commands]);
        registry.verify_indices().unwrap();

        assert!(registry.remove("a").is_some());
        registry.verify_indices().unwrap();
        assert_eq!(registry.user_sessions("alice"), vec!["b".to_string()]);
        assert_eq!(registry.topic_sessions(Topic::Commands), vec!["b".to_string()]);
        assert!(registry.topic_sessions(Topic::Alerts).is_empty());

        // Second removal is a no-op
        assert!(registry.remove("a").is_none());
        registry.verify_indices().unwrap();
    }

    #[test]
    fn test_subscribe_is_idempotent() {
        let mut registry = Registry::default();
        registry.insert(entry("a"));
        registry.subscribe("a", &[Topic::System]);
        registry.subscribe("a", &[Topic::System]);
        assert_eq!(registry.topic_sessions(Topic::System).len(), 1);
        assert_eq!(registry.get("a").unwrap().subscriptions.len(), 1);

        registry.unsubscribe("a", &[Topic::System]);
        registry.unsubscribe("a", &[Topic::System, Topic::Metrics]);
        assert!(registry.get("a").unwrap().subscriptions.is_empty());
        registry.verify_indices().unwrap();
    }

    #[test]
    fn test_unknown_session_operations_are_noops() {
        let mut registry = Registry::default();
        assert!(!registry.subscribe("ghost", &[Topic::System]));
        assert!(!registry.set_identity("ghost", identity("bob")));
        assert!(registry.remove("ghost").is_none());
        assert!(registry.topic_sessions(Topic::System).is_empty());
        registry.verify_indices().unwrap();
    }

    #[test]
    fn test_reauth_moves_user_bucket() {
        let mut registry = Registry::default();
        registry.insert(entry("a"));
        registry.set_identity("a", identity("alice"));
        registry.set_identity("a", identity("bob"));
        assert!(registry.user_sessions("alice").is_empty());
        assert_eq!(registry.user_sessions("bob"), vec!["a".to_string()]);
        registry.verify_indices().unwrap();
    }

    #[test]
    fn test_topics_union_is_deduplicated() {
        let mut registry = Registry::default();
        registry.insert(entry("a"));
        registry.insert(entry("b"));
        registry.subscribe("a", &[Topic::Alerts, Topic::System]);
        registry.subscribe("b", &[Topic::System]);
        let mut ids = registry.topics_sessions(&[Topic::Alerts, Topic::System]);
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }
}
