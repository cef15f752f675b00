//! Port manager
//!
//! Owns one [`PortWorker`] per port identifier. Create it at the top of the
//! application, hand out controllers from it, and call
//! [`PortManager::shutdown_all`] (or drop it) on exit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::worker::{PortStats, PortWorker};
use super::BusError;
use crate::config::BusConfig;
use crate::device::ServoController;
use crate::protocol::{Connector, SerialConnector};

/// Registry of shared ports keyed by port identifier
pub struct PortManager {
    config: BusConfig,
    ports: Mutex<HashMap<String, Arc<PortWorker>>>,
}

impl Default for PortManager {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl PortManager {
    /// Create a manager; workers share `config`
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            ports: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<PortWorker>>> {
        self.ports.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Settings handed to every worker
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Worker for a serial port, opened and started on first use
    pub fn get_or_create(&self, port: &str) -> Result<Arc<PortWorker>, BusError> {
        let baud_rate = self.config.baud_rate;
        let read_timeout = self.config.read_timeout();
        self.get_or_create_with(port, || -> Box<dyn Connector> {
            Box::new(SerialConnector::new(port, baud_rate, read_timeout))
        })
    }

    /// Worker for `port` using a custom transport.
    ///
    /// `make_connector` is only called when the port is not known yet.
    pub fn get_or_create_with<F>(
        &self,
        port: &str,
        make_connector: F,
    ) -> Result<Arc<PortWorker>, BusError>
    where
        F: FnOnce() -> Box<dyn Connector>,
    {
        let mut ports = self.lock();
        if let Some(worker) = ports.get(port) {
            if !worker.is_running() {
                worker.start()?;
            }
            return Ok(worker.clone());
        }

        let worker = Arc::new(PortWorker::new(port, make_connector(), self.config.clone()));
        worker.start()?;
        ports.insert(port.to_string(), worker.clone());
        tracing::info!(port, "registered shared port");
        Ok(worker)
    }

    /// Existing worker for `port`
    pub fn get(&self, port: &str) -> Option<Arc<PortWorker>> {
        self.lock().get(port).cloned()
    }

    /// Controller handle for a device on a serial port, with a generated id
    pub fn controller(&self, port: &str, device_number: u8) -> Result<ServoController, BusError> {
        self.named_controller(port, device_number, default_device_id(port, device_number))
    }

    /// Controller handle with an explicit device id
    pub fn named_controller(
        &self,
        port: &str,
        device_number: u8,
        device_id: impl Into<String>,
    ) -> Result<ServoController, BusError> {
        let worker = self.get_or_create(port)?;
        ServoController::attach(worker, device_id, device_number)
    }

    /// Controller handle on a port with a custom transport
    pub fn controller_with<F>(
        &self,
        port: &str,
        make_connector: F,
        device_number: u8,
    ) -> Result<ServoController, BusError>
    where
        F: FnOnce() -> Box<dyn Connector>,
    {
        let worker = self.get_or_create_with(port, make_connector)?;
        ServoController::attach(worker, default_device_id(port, device_number), device_number)
    }

    /// Statistics for every port, sorted by port identifier
    pub fn stats(&self) -> Vec<PortStats> {
        let mut stats: Vec<PortStats> = self.lock().values().map(|w| w.stats()).collect();
        stats.sort_by(|a, b| a.port.cmp(&b.port));
        stats
    }

    /// Statistics for one port
    pub fn port_stats(&self, port: &str) -> Result<PortStats, BusError> {
        self.get(port)
            .map(|w| w.stats())
            .ok_or_else(|| BusError::UnknownPort(port.to_string()))
    }

    /// Number of ports with a worker
    pub fn port_count(&self) -> usize {
        self.lock().len()
    }

    /// Stop every worker and release its transport
    pub fn shutdown_all(&self) {
        let workers: Vec<Arc<PortWorker>> = self.lock().drain().map(|(_, w)| w).collect();
        if workers.is_empty() {
            return;
        }
        let count = workers.len();
        for worker in workers {
            worker.stop();
        }
        tracing::info!(count, "shut down all shared ports");
    }
}

impl Drop for PortManager {
    fn drop(&mut self) {
        self.shutdown_all();
    }
}

/// Id used when the caller does not name a device
pub fn default_device_id(port: &str, device_number: u8) -> String {
    format!("{}#{}", port, device_number)
}
