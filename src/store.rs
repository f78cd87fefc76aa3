// src/store.rs

//! Interfaces to the rule, resource and session stores, plus an in-memory
//! implementation of all three.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::rules::Rule;

/// Sessions kept before the oldest are dropped
pub const DEFAULT_MAX_SESSIONS: usize = 200;

/// A stored payload that `replaceResource` actions refer to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    pub data_base64: String,
}

/// Which part of the engine produced a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionSource {
    #[default]
    Proxy,
    Tunnel,
    Flow,
}

/// One observed exchange, before the sink assigns it an id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub url: String,
    pub method: String,
    pub status: u16,
    pub content_type: String,
    pub size_bytes: u64,
    pub duration_ms: u64,
    pub matched_rule_id: Option<String>,
    pub applied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_headers: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub source: SessionSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub entry: SessionEntry,
}

pub trait RuleSource: Send + Sync {
    fn list(&self) -> Vec<Rule>;
}

pub trait ResourceStore: Send + Sync {
    fn get(&self, id: &str) -> Option<Resource>;
}

pub trait SessionSink: Send + Sync {
    fn add(&self, entry: SessionEntry) -> SessionRecord;
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ListFile<T> {
    Bare(Vec<T>),
    Wrapped { items: Vec<T> },
}

impl<T> ListFile<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            ListFile::Bare(items) | ListFile::Wrapped { items } => items,
        }
    }
}

/// Rules, resources and sessions held in memory.
///
/// Only the newest `max_sessions` sessions are retained.
pub struct MemoryStore {
    rules: RwLock<Vec<Rule>>,
    resources: RwLock<HashMap<String, Resource>>,
    sessions: Mutex<VecDeque<SessionRecord>>,
    max_sessions: usize,
    next_id: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore {
            rules: RwLock::default(),
            resources: RwLock::default(),
            sessions: Mutex::default(),
            max_sessions: DEFAULT_MAX_SESSIONS,
            next_id: AtomicU64::new(0),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps the session history; zero is treated as one.
    pub fn with_session_limit(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions.max(1);
        self
    }

    pub fn with_rules(rules: Vec<Rule>) -> Self {
        let store = Self::default();
        store.set_rules(rules);
        store
    }

    pub fn set_rules(&self, rules: Vec<Rule>) {
        if let Ok(mut current) = self.rules.write() {
            *current = rules;
        }
    }

    pub fn add_rule(&self, rule: Rule) {
        if let Ok(mut current) = self.rules.write() {
            current.push(rule);
        }
    }

    pub fn remove_rule(&self, id: &str) -> bool {
        match self.rules.write() {
            Ok(mut current) => {
                let before = current.len();
                current.retain(|r| r.id != id);
                current.len() != before
            }
            Err(_) => false,
        }
    }

    pub fn insert_resource(&self, resource: Resource) {
        if let Ok(mut resources) = self.resources.write() {
            resources.insert(resource.id.clone(), resource);
        }
    }

    pub fn remove_resource(&self, id: &str) -> Option<Resource> {
        self.resources.write().ok()?.remove(id)
    }

    /// Loads rules from a JSON file holding either an array or `{"items": [...]}`.
    /// Replaces the current rule set and returns how many were read.
    pub fn load_rules_file<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let text = fs::read_to_string(path.as_ref())?;
        let rules = serde_json::from_str::<ListFile<Rule>>(&text)?.into_vec();
        let count = rules.len();
        self.set_rules(rules);
        info!("Loaded {} rules from {}", count, path.as_ref().display());
        Ok(count)
    }

    pub fn load_resources_file<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let text = fs::read_to_string(path.as_ref())?;
        let resources = serde_json::from_str::<ListFile<Resource>>(&text)?.into_vec();
        let count = resources.len();
        for resource in resources {
            self.insert_resource(resource);
        }
        info!("Loaded {} resources from {}", count, path.as_ref().display());
        Ok(count)
    }

    /// Retained sessions, oldest first.
    pub fn sessions(&self) -> Vec<SessionRecord> {
        self.sessions
            .lock()
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear_sessions(&self) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.clear();
        }
    }
}

impl RuleSource for MemoryStore {
    fn list(&self) -> Vec<Rule> {
        self.rules.read().map(|r| r.clone()).unwrap_or_default()
    }
}

impl ResourceStore for MemoryStore {
    fn get(&self, id: &str) -> Option<Resource> {
        self.resources.read().ok()?.get(id).cloned()
    }
}

impl SessionSink for MemoryStore {
    fn add(&self, entry: SessionEntry) -> SessionRecord {
        let record = SessionRecord {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            timestamp: Utc::now(),
            entry,
        };
        debug!(
            "Session #{}: {} {} -> {}",
            record.id, record.entry.method, record.entry.url, record.entry.status
        );
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.push_back(record.clone());
            while sessions.len() > self.max_sessions {
                sessions.pop_front();
            }
        }
        record
    }
}
