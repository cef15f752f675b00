//! Helpers shared by the integration tests
#![allow(dead_code)]

use servobus_core::config::BusConfig;
use servobus_core::protocol::Connector;
use servobus_core::sim::SimulatedBus;
use std::time::{Duration, Instant};

/// Short timings so failure paths finish quickly
pub fn test_config() -> BusConfig {
    BusConfig {
        poll_interval_ms: 10,
        inter_command_delay_ms: 0,
        default_timeout_ms: 200,
        max_retries: 3,
        stop_join_timeout_ms: 2000,
        read_timeout_ms: 10,
        ..BusConfig::default()
    }
}

pub fn sim_connector(bus: &SimulatedBus) -> Box<dyn Connector> {
    Box::new(bus.connector())
}

/// Poll `check` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    check()
}
