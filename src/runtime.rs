// src/runtime.rs
//
// Single process-wide handle bundling the broker, CAN driver, config, and
// status aggregator, constructed once in main and passed to every
// subsystem, in place of module-scoped globals.

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::broker::Broker;
use crate::can::CanDriver;
use crate::config::AdapterConfig;
use crate::status::StatusAggregator;

pub struct Runtime {
    pub broker: Arc<Broker>,
    pub driver: Arc<dyn CanDriver>,
    pub config: Arc<RwLock<AdapterConfig>>,
    pub status: Arc<StatusAggregator>,
}

impl Runtime {
    pub fn new(driver: Arc<dyn CanDriver>, config: AdapterConfig) -> Arc<Self> {
        let broker = Broker::new();
        let config = Arc::new(RwLock::new(config));
        let status = Arc::new(StatusAggregator::new(broker.clone(), driver.clone(), config.clone()));
        Arc::new(Self {
            broker,
            driver,
            config,
            status,
        })
    }
}
