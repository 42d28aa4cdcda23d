//! In-memory implementations of the storage ports

use crate::domain::capability::{
    Capabilities, ContactInfo, ContactStore, ContactUpdate, RcsStatus, RegistrationStatus,
};
use crate::domain::instant_messaging::{DeliveryStatus, InstantMessage, MessageHistory};
use crate::domain::presence::Registry;
use crate::domain::shared::ContactId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Contact store kept in memory
pub struct MemoryContactStore {
    contacts: Arc<tokio::sync::RwLock<HashMap<ContactId, ContactInfo>>>,
}

impl MemoryContactStore {
    pub fn new() -> Self {
        Self {
            contacts: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
        }
    }

    pub async fn len(&self) -> usize {
        self.contacts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.contacts.read().await.is_empty()
    }
}

impl Default for MemoryContactStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContactStore for MemoryContactStore {
    async fn get_contact_info(&self, contact: &ContactId) -> ContactInfo {
        self.contacts
            .read()
            .await
            .get(contact)
            .cloned()
            .unwrap_or_else(|| ContactInfo::unknown(contact.clone()))
    }

    async fn set_contact_capabilities(
        &self,
        contact: &ContactId,
        capabilities: Capabilities,
        rcs_status: RcsStatus,
        registration_status: RegistrationStatus,
    ) {
        debug!(
            "Contact {} -> {:?}/{:?}",
            contact, rcs_status, registration_status
        );
        self.contacts.write().await.insert(
            contact.clone(),
            ContactInfo {
                contact: contact.clone(),
                capabilities,
                rcs_status,
                registration_status,
                last_refresh: Some(Utc::now()),
            },
        );
    }

    async fn set_contact_capabilities_timestamp(&self, contact: &ContactId, at: DateTime<Utc>) {
        let mut contacts = self.contacts.write().await;
        contacts
            .entry(contact.clone())
            .or_insert_with(|| ContactInfo::unknown(contact.clone()))
            .last_refresh = Some(at);
    }

    async fn update_contact(&self, contact: &ContactId, update: ContactUpdate) -> ContactInfo {
        let mut contacts = self.contacts.write().await;
        let current = contacts
            .get(contact)
            .cloned()
            .unwrap_or_else(|| ContactInfo::unknown(contact.clone()));
        let mut updated = update(&current);
        updated.contact = contact.clone();
        updated.last_refresh = Some(Utc::now());
        contacts.insert(contact.clone(), updated.clone());
        updated
    }
}

/// Registry kept in memory
#[derive(Default)]
pub struct MemoryRegistry {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Registry for MemoryRegistry {
    fn read_string(&self, key: &str) -> Option<String> {
        self.values
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
            .cloned()
    }

    fn write_string(&self, key: &str, value: &str) {
        self.values
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key.to_string(), value.to_string());
    }

    fn remove_parameter(&self, key: &str) {
        self.values
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(key);
    }
}

/// Message history kept in memory
#[derive(Default)]
pub struct MemoryMessageHistory {
    messages: tokio::sync::RwLock<Vec<InstantMessage>>,
}

impl MemoryMessageHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<InstantMessage> {
        self.messages.read().await.clone()
    }
}

#[async_trait]
impl MessageHistory for MemoryMessageHistory {
    async fn add_message(&self, message: InstantMessage) {
        self.messages.write().await.push(message);
    }

    async fn set_delivery_status(
        &self,
        message_id: &str,
        status: DeliveryStatus,
    ) -> Option<InstantMessage> {
        let mut messages = self.messages.write().await;
        let message = messages.iter_mut().find(|m| {
            m.message_id == message_id || m.imdn_message_id.as_deref() == Some(message_id)
        })?;
        message.status = Some(status);
        message.updated_at = Utc::now();
        Some(message.clone())
    }

    async fn get_message(&self, message_id: &str) -> Option<InstantMessage> {
        self.messages
            .read()
            .await
            .iter()
            .find(|m| m.message_id == message_id || m.imdn_message_id.as_deref() == Some(message_id))
            .cloned()
    }
}
