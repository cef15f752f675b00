mod common;

use common::{sim_connector, test_config, wait_until};
use pretty_assertions::assert_eq;
use servobus_core::bus::{PortManager, PortState, Priority};
use servobus_core::config::BusConfig;
use servobus_core::protocol::{ControllerErrors, ScriptState};
use servobus_core::sim::SimulatedBus;
use std::collections::HashMap;
use std::sync::mpsc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(3);

#[test]
fn test_writes_reach_the_controller() {
    let bus = SimulatedBus::new();
    bus.add_controller(12, 6);
    let manager = PortManager::new(test_config());
    let head = manager.controller_with("sim0", || sim_connector(&bus), 12).unwrap();

    assert!(head.set_speed(5, 140, Priority::Normal));
    assert!(head.set_acceleration(5, 20, Priority::Normal));
    assert!(head.set_target(5, 1500.0, Priority::Normal));

    assert!(wait_until(WAIT, || bus.target(12, 5) == Some(1500.0)));
    let controller = bus.controller(12).unwrap();
    assert_eq!(controller.speeds[5], 140);
    assert_eq!(controller.accelerations[5], 20);
}

#[test]
fn test_batch_read_collects_answered_channels() {
    let bus = SimulatedBus::new();
    bus.add_controller(12, 6);
    let config = BusConfig {
        default_timeout_ms: 50,
        ..test_config()
    };
    let manager = PortManager::new(config);
    let mut head = manager.controller_with("sim0", || sim_connector(&bus), 12).unwrap();
    for channel in 0..6 {
        bus.set_position(12, channel, 1000.0 + channel as f64 * 10.0);
    }

    // Two more channels than the controller has; those never answer
    head.set_channel_count(8);
    let (tx, rx) = mpsc::channel();
    assert!(head.get_all_positions_batch(move |positions| {
        let _ = tx.send(positions);
    }));

    let positions = rx.recv_timeout(WAIT).unwrap();
    let expected: HashMap<u8, f64> = (0..6).map(|c| (c, 1000.0 + c as f64 * 10.0)).collect();
    assert_eq!(positions, expected);
    // Exactly one batch callback
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn test_batch_read_with_no_channels() {
    let bus = SimulatedBus::new();
    bus.add_controller(12, 6);
    let manager = PortManager::new(test_config());
    let mut head = manager.controller_with("sim0", || sim_connector(&bus), 12).unwrap();
    head.set_channel_count(0);

    let (tx, rx) = mpsc::channel();
    assert!(head.get_all_positions_batch(move |positions| {
        let _ = tx.send(positions);
    }));
    assert!(rx.try_recv().unwrap().is_empty());
    assert!(bus.frames().is_empty());
}

#[tokio::test]
async fn test_async_position_read() {
    let bus = SimulatedBus::new();
    bus.add_controller(12, 6);
    bus.set_position(12, 3, 1750.25);
    let manager = PortManager::new(test_config());
    let head = manager.controller_with("sim0", || sim_connector(&bus), 12).unwrap();

    let position = head.get_position_async(3, Priority::Realtime).await;
    assert_eq!(position, Some(1750.25));

    bus.set_silent(true);
    let missing = tokio::time::timeout(WAIT, head.get_position_async(3, Priority::Normal))
        .await
        .unwrap();
    assert_eq!(missing, None);
}

#[test]
fn test_status_reads() {
    let bus = SimulatedBus::new();
    bus.add_controller(12, 6);
    bus.set_errors(12, ControllerErrors::SERIAL_OVERRUN);
    bus.set_script_running(12, true);
    bus.set_moving(12, true);
    let manager = PortManager::new(test_config());
    let head = manager.controller_with("sim0", || sim_connector(&bus), 12).unwrap();

    let (tx, rx) = mpsc::channel();
    assert!(head.get_errors(move |errors| { let _ = tx.send(errors); }, Priority::Normal));
    let errors = rx.recv_timeout(WAIT).unwrap().unwrap();
    assert_eq!(errors.names(), vec!["serial overrun"]);

    let (tx, rx) = mpsc::channel();
    assert!(head.get_script_status(move |state| { let _ = tx.send(state); }, Priority::Normal));
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), Some(ScriptState::Running));

    let (tx, rx) = mpsc::channel();
    assert!(head.get_moving_state(move |moving| { let _ = tx.send(moving); }, Priority::Normal));
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), Some(true));
}

#[test]
fn test_detect_channel_count() {
    let bus = SimulatedBus::new();
    bus.add_controller(12, 12);
    let manager = PortManager::new(test_config());
    let mut head = manager.controller_with("sim0", || sim_connector(&bus), 12).unwrap();

    assert_eq!(head.channel_count(), None);
    assert_eq!(head.detect_channel_count(Duration::from_millis(100)), Some(12));
    assert_eq!(head.channel_count(), Some(12));

    // Emergency stop now covers all twelve channels
    for channel in 0..12 {
        bus.set_position(12, channel, 900.0);
    }
    assert!(head.emergency_stop());
    assert!(wait_until(WAIT, || {
        (0..12).all(|c| bus.target(12, c) == Some(1500.0))
    }));
}

#[test]
fn test_detect_channel_count_without_controller() {
    let bus = SimulatedBus::new();
    let manager = PortManager::new(test_config());
    let mut head = manager.controller_with("sim0", || sim_connector(&bus), 40).unwrap();

    assert_eq!(head.detect_channel_count(Duration::from_millis(30)), None);
    assert_eq!(head.channel_count(), None);
}

#[test]
fn test_controller_status() {
    let bus = SimulatedBus::new();
    bus.add_controller(12, 6);
    let manager = PortManager::new(test_config());
    let mut head = manager.controller_with("sim0", || sim_connector(&bus), 12).unwrap();
    head.set_channel_count(6);
    assert!(wait_until(WAIT, || head.worker().is_connected()));

    let status = head.status();
    assert_eq!(status.device_id, "sim0#12");
    assert_eq!(status.device_number, 12);
    assert_eq!(status.channel_count, Some(6));
    assert!(status.connected);
    assert_eq!(status.port.port, "sim0");
    assert_eq!(head.port_name(), "sim0");

    let json = serde_json::to_string(&status).unwrap();
    assert!(json.contains("\"device_number\":12"));
}

#[test]
fn test_missing_serial_port_keeps_worker_alive() {
    let manager = PortManager::new(test_config());
    let head = manager
        .controller("/dev/servobus-test-missing", 12)
        .unwrap();
    let worker = head.worker().clone();

    assert!(wait_until(WAIT, || worker.state() == PortState::Reconnecting));
    assert!(!worker.is_connected());
    assert!(worker.stats().last_error.is_some());
    // Writes are still accepted; they fail on the worker
    assert!(head.set_target(0, 1500.0, Priority::Normal));
}
