use std::sync::Arc;
use tracing::info;

use crate::consumer::{Consumer, ConsumerConfig};
use crate::driver::StoreDriver;
use crate::error::DbEventResult;
use crate::event::Event;

/// Wires a [`StoreDriver`] to producers and consumers.
pub struct EventStore<D: StoreDriver + 'static> {
    driver: Arc<D>,
}

impl<D: StoreDriver + 'static> EventStore<D> {
    /// Provision the store and wrap the driver.
    ///
    /// # Errors
    ///
    /// Provisioning failures are returned as-is; no store is created, so no
    /// consumer can run against a half-provisioned schema.
    pub async fn new(driver: D) -> DbEventResult<Self> {
        let driver = Arc::new(driver);
        driver.provision().await?;

        info!("Event store ready");
        Ok(Self { driver })
    }

    /// Append events as one atomic batch.
    pub async fn produce(&self, events: &[Event]) -> DbEventResult<()> {
        self.driver.create(events).await
    }

    /// Create a consumer for `read_group` backed by this store's driver.
    pub fn new_consumer(&self, read_group: impl Into<String>, config: ConsumerConfig) -> Consumer {
        Consumer::new(read_group, self.driver.clone(), config)
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    pub async fn close(&self) -> DbEventResult<()> {
        self.driver.close().await
    }
}
