use crate::Result;
use serde::Deserialize;
use std::collections::BTreeMap;

/// Key/value statistics as returned by `stats` and `stats-tube`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct Stats(BTreeMap<String, serde_yaml::Value>);

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the YAML dictionary carried by an `OK <bytes>` response
    pub fn from_yaml(bytes: &[u8]) -> Result<Self> {
        Ok(serde_yaml::from_slice(bytes)?)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<serde_yaml::Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(|value| value.as_u64())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
