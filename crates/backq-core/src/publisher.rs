use crate::{Message, PublishOptions, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Something that can put a message on a queue
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Prepare the publisher (connect, select queue). Must be safe to call repeatedly.
    async fn start(&self) -> bool;

    /// Publish a message, returning the broker's identifier for it
    async fn publish(&self, message: &Message, options: &PublishOptions) -> Result<String>;
}

/// Registry of publishers addressable by name from a serialized message
#[derive(Clone)]
pub struct PublisherRegistry {
    publishers: Arc<RwLock<HashMap<String, Arc<dyn Publisher>>>>,
}

impl PublisherRegistry {
    pub fn new() -> Self {
        PublisherRegistry {
            publishers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a publisher under a name, replacing any previous one
    pub fn register<P: Publisher + 'static>(&self, name: impl Into<String>, publisher: P) {
        self.register_arc(name, Arc::new(publisher));
    }

    pub fn register_arc(&self, name: impl Into<String>, publisher: Arc<dyn Publisher>) {
        let mut publishers = self.publishers.write();
        publishers.insert(name.into(), publisher);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Publisher>> {
        let publishers = self.publishers.read();
        publishers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        let publishers = self.publishers.read();
        publishers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let publishers = self.publishers.read();
        publishers.keys().cloned().collect()
    }
}

impl Default for PublisherRegistry {
    fn default() -> Self {
        Self::new()
    }
}
