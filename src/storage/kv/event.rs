//! Event subscription operations for the key-value backend.
//!
//! Each subscription is one JSON document keyed by its name.

use std::collections::HashMap;

use async_trait::async_trait;

use super::bucket::KvBucket;
use super::KvStorage;
use crate::storage::error::{Result, StorageError};
use crate::storage::{EventSubscription, EventSubscriptionStorage, ReadEventSubscriptionStorage};
use crate::workflow::EventFlag;

#[async_trait]
impl<B: KvBucket> ReadEventSubscriptionStorage for KvStorage<B> {
    async fn retrieve_event_subscriptions(
        &self,
        names: &[String],
    ) -> Result<HashMap<String, EventSubscription>> {
        let mut subscriptions = HashMap::new();
        for name in names {
            let Some(raw) = self.event_store.get(name).await? else {
                continue;
            };
            subscriptions.insert(name.clone(), serde_json::from_slice(&raw)?);
        }
        Ok(subscriptions)
    }

    async fn retrieve_event_subscriptions_by_event(
        &self,
        flag: EventFlag,
    ) -> Result<Vec<EventSubscription>> {
        if !flag.is_valid() {
            return Err(StorageError::InvalidEventType(flag.to_string()));
        }
        let mut subscriptions = Vec::new();
        for name in self.event_store.keys().await? {
            let Some(raw) = self.event_store.get(&name).await? else {
                continue;
            };
            let sub: EventSubscription = serde_json::from_slice(&raw)?;
            if sub.event_flag() == Some(flag) {
                subscriptions.push(sub);
            }
        }
        Ok(subscriptions)
    }
}

#[async_trait]
impl<B: KvBucket> EventSubscriptionStorage for KvStorage<B> {
    async fn store_event_subscription(&self, name: &str, sub: &EventSubscription) -> Result<()> {
        if name.is_empty() {
            return Err(StorageError::EmptyKey);
        }
        sub.validate()?;
        self.event_store
            .set(name, serde_json::to_vec(sub)?)
            .await
    }

    async fn delete_event_subscription(&self, name: &str) -> Result<()> {
        self.event_store.delete(name).await
    }
}
