//! Resubscription registry: the subscriptions replayed after a reconnect.

use parking_lot::RwLock;

use crate::protocol::{ConsumerType, SubscribeReq};

/// One active subscription. Equality covers all four fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionRecord {
    pub topic: String,
    pub tag_pattern: String,
    pub group_name: String,
    pub consumer_type: ConsumerType,
}

impl SubscriptionRecord {
    pub fn new(topic: &str, tag_pattern: &str, group_name: &str, consumer_type: ConsumerType) -> Self {
        Self {
            topic: topic.to_string(),
            tag_pattern: tag_pattern.to_string(),
            group_name: group_name.to_string(),
            consumer_type,
        }
    }

    pub fn to_request(&self) -> SubscribeReq {
        SubscribeReq {
            group_name: self.group_name.clone(),
            topic_name: self.topic.clone(),
            tag_regex: self.tag_pattern.clone(),
            consumer_type: self.consumer_type,
        }
    }
}

/// Insertion-ordered set of records; replay follows subscription order.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    records: RwLock<Vec<SubscriptionRecord>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if an equal record was already present.
    pub fn insert(&self, record: SubscriptionRecord) -> bool {
        let mut records = self.records.write();
        if records.contains(&record) {
            return false;
        }
        records.push(record);
        true
    }

    /// Returns `false` if no equal record was present.
    pub fn remove(&self, record: &SubscriptionRecord) -> bool {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|r| r != record);
        records.len() != before
    }

    pub fn contains(&self, record: &SubscriptionRecord) -> bool {
        self.records.read().contains(record)
    }

    pub fn snapshot(&self) -> Vec<SubscriptionRecord> {
        self.records.read().clone()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}
