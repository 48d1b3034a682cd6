//! Management-plane access to entity runtime properties.

use crate::connection::{ConnectionOptions, Credential};
use crate::error::MessagingError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Message counts of one subscription
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionDetails {
    pub active_message_count: u64,
    pub dead_letter_message_count: u64,
}

/// Broker management surface
#[async_trait]
pub trait AdminTransport: Send + Sync {
    async fn subscription_runtime_properties(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<SubscriptionDetails, MessagingError>;
}

/// Opens management clients from resolved credentials
#[async_trait]
pub trait AdminConnector: Send + Sync {
    async fn connect_admin(
        &self,
        credential: &Credential,
    ) -> Result<Arc<dyn AdminTransport>, MessagingError>;
}

/// Reads runtime properties of broker entities
pub struct AdminClient {
    name: String,
    transport: Arc<dyn AdminTransport>,
}

impl AdminClient {
    /// Resolve the credential from `options` and connect.
    ///
    /// Only the credential fields matter here; entity settings are ignored.
    pub async fn open(
        options: &ConnectionOptions,
        connector: &dyn AdminConnector,
    ) -> Result<Self, MessagingError> {
        let credential = options.credential()?;
        let transport = connector.connect_admin(&credential).await?;

        let name = options.connection_name().to_string();
        info!(connection = %name, credential = credential.kind(), "Admin client opened");

        Ok(Self { name, transport })
    }

    /// Active and dead-lettered message counts of a subscription
    pub async fn subscription_details(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<SubscriptionDetails, MessagingError> {
        let details = self
            .transport
            .subscription_runtime_properties(topic, subscription)
            .await?;

        debug!(
            connection = %self.name,
            topic = %topic,
            subscription = %subscription,
            active = details.active_message_count,
            dead_lettered = details.dead_letter_message_count,
            "Fetched subscription details"
        );
        Ok(details)
    }
}

#[cfg(test)]
#[path = "admin_tests.rs"]
mod tests;
