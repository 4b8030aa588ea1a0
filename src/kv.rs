use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::runtime::StateMachine;

/// Mutating commands for the key-value store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KvCommand {
    Set { key: String, value: String },
    Delete { key: String },
}

/// Read-only queries for the key-value store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KvQuery {
    Get { key: String },
}

/// Result of applying a command or query to the KV store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KvResult {
    Ok,
    Value(Option<String>),
}

/// A simple in-memory key-value store. Ordered so snapshots are byte-identical
/// on every node holding the same state.
#[derive(Debug, Default)]
pub struct KvStore {
    data: BTreeMap<String, String>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl StateMachine for KvStore {
    type Command = KvCommand;
    type Query = KvQuery;
    type Output = KvResult;

    fn apply(&mut self, command: KvCommand) -> KvResult {
        match command {
            KvCommand::Set { key, value } => {
                self.data.insert(key, value);
                KvResult::Ok
            }
            KvCommand::Delete { key } => {
                self.data.remove(&key);
                KvResult::Ok
            }
        }
    }

    fn query(&self, query: &KvQuery) -> KvResult {
        match query {
            KvQuery::Get { key } => KvResult::Value(self.data.get(key).cloned()),
        }
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.data)?)
    }

    fn restore(&mut self, data: &[u8]) -> Result<()> {
        self.data = if data.is_empty() {
            BTreeMap::new()
        } else {
            serde_json::from_slice(data)?
        };
        Ok(())
    }
}
