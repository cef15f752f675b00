mod common;

use common::{sim_connector, test_config, wait_until};
use pretty_assertions::assert_eq;
use servobus_core::bus::{BusError, Command, PortManager, PortState, PortWorker, Priority};
use servobus_core::config::BusConfig;
use servobus_core::device::ServoController;
use servobus_core::protocol::{CommandKind, Response};
use servobus_core::sim::SimulatedBus;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(3);

fn two_controller_bus() -> SimulatedBus {
    let bus = SimulatedBus::new();
    bus.add_controller(12, 6);
    bus.add_controller(13, 18);
    bus
}

/// Keep the worker busy in a read nobody answers so that later submissions
/// pile up in the queue
fn block_worker(bus: &SimulatedBus, controller: &ServoController) {
    bus.set_silent(true);
    assert!(controller.get_position(0, |_| {}, Priority::Normal));
    assert!(wait_until(WAIT, || bus.frames().len() == 1));
}

#[test]
fn test_emergency_overtakes_normal_across_devices() {
    let bus = two_controller_bus();
    let manager = PortManager::new(test_config());
    let a = manager.controller_with("sim0", || sim_connector(&bus), 12).unwrap();
    let b = manager.controller_with("sim0", || sim_connector(&bus), 13).unwrap();

    block_worker(&bus, &a);
    assert!(a.set_target(1, 1000.0, Priority::Normal));
    assert!(b.set_target(2, 2000.0, Priority::Emergency));
    bus.set_silent(false);

    assert!(wait_until(WAIT, || bus.frames().len() == 3));
    let commands = bus.commands();
    assert_eq!(
        commands[1],
        (
            13,
            CommandKind::SetTarget {
                channel: 2,
                target: 2000.0
            }
        )
    );
    assert_eq!(
        commands[2],
        (
            12,
            CommandKind::SetTarget {
                channel: 1,
                target: 1000.0
            }
        )
    );
    assert_eq!(bus.target(13, 2), Some(2000.0));
}

#[test]
fn test_emergency_stop_runs_before_queued_work() {
    let bus = two_controller_bus();
    let manager = PortManager::new(test_config());
    let mut head = manager.controller_with("sim0", || sim_connector(&bus), 13).unwrap();
    head.set_channel_count(18);

    block_worker(&bus, &head);
    assert!(head.set_target(3, 900.0, Priority::Normal));
    assert!(head.get_position(4, |_| {}, Priority::Low));
    assert!(head.emergency_stop());
    bus.set_silent(false);

    assert!(wait_until(WAIT, || bus.frames().len() == 1 + 18 + 2));
    let commands = bus.commands();
    for (i, (device, kind)) in commands[1..19].iter().enumerate() {
        assert_eq!(*device, 13);
        assert_eq!(
            *kind,
            CommandKind::SetTarget {
                channel: i as u8,
                target: 1500.0
            }
        );
    }
    assert!(matches!(commands[19].1, CommandKind::SetTarget { channel: 3, .. }));
    assert!(matches!(commands[20].1, CommandKind::GetPosition { channel: 4 }));
}

#[test]
fn test_duplicate_device_number_rejected() {
    let bus = two_controller_bus();
    let manager = PortManager::new(test_config());
    let first = manager
        .controller_with("sim0", || sim_connector(&bus), 12)
        .unwrap();
    let worker = manager.get("sim0").unwrap();

    let err = ServoController::attach(worker.clone(), "intruder", 12).unwrap_err();
    match err {
        BusError::DuplicateDeviceNumber {
            device_number,
            existing,
        } => {
            assert_eq!(device_number, 12);
            assert_eq!(existing, first.device_id());
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(
        worker.registry().device_id_for(12).as_deref(),
        Some(first.device_id())
    );

    // Same id twice is also refused
    assert!(matches!(
        manager.controller_with("sim0", || sim_connector(&bus), 12),
        Err(BusError::DuplicateDeviceId(_))
    ));
    assert!(matches!(
        ServoController::attach(worker.clone(), "zero", 0),
        Err(BusError::InvalidDeviceNumber(0))
    ));

    // Dropping the handle frees the number
    drop(first);
    assert!(ServoController::attach(worker, "replacement", 12).is_ok());
}

#[test]
fn test_sync_read_timeout_does_not_leak() {
    let bus = two_controller_bus();
    let manager = PortManager::new(test_config());
    let head = manager.controller_with("sim0", || sim_connector(&bus), 12).unwrap();
    bus.set_silent(true);

    assert_eq!(head.get_position_sync(0, Duration::from_millis(100)), None);

    let worker = head.worker().clone();
    assert!(wait_until(WAIT, || worker.pending_responses() == 0));
    let stats = worker.stats();
    assert_eq!(stats.responses_timeout, 1);
    assert_eq!(stats.pending_responses, 0);
    assert_eq!(stats.failed_attempts, 0);
}

#[test]
fn test_always_failing_command_retries_then_fails_once() {
    let bus = two_controller_bus();
    bus.set_fail_writes(true);
    let manager = PortManager::new(test_config());
    let head = manager.controller_with("sim0", || sim_connector(&bus), 12).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();
    let counter = calls.clone();
    assert!(head.get_position(
        0,
        move |value| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(value);
        },
        Priority::Normal,
    ));

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), None);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let stats = head.worker().stats();
    assert_eq!(stats.failed_attempts, 4);
    assert_eq!(stats.commands_failed, 1);
    assert_eq!(stats.pending_responses, 0);
    assert!(stats.last_error.is_some());
}

#[test]
fn test_disconnected_set_target_fails_after_retries() {
    let bus = two_controller_bus();
    bus.set_online(false);
    let worker = PortWorker::new("sim0", sim_connector(&bus), test_config());
    worker.start().unwrap();

    let (tx, rx) = mpsc::channel();
    let command = Command::new(
        "sim0#12",
        12,
        CommandKind::SetTarget {
            channel: 0,
            target: 1500.0,
        },
        Priority::Normal,
    )
    .with_max_retries(3)
    .with_callback(move |value| {
        let _ = tx.send(value);
    });

    // Queuing succeeds even though nothing is connected
    assert!(worker.submit(command).is_ok());
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), None);

    // The first miss is free, then max_retries + 1 counted attempts
    let stats = worker.stats();
    assert_eq!(stats.failed_attempts, 5);
    assert_eq!(stats.commands_failed, 1);
    assert_eq!(stats.commands_processed, 0);
    assert!(!stats.connected);
    assert!(bus.frames().is_empty());
    worker.stop();
}

#[test]
fn test_first_attempt_while_disconnected_keeps_retries() {
    let bus = two_controller_bus();
    bus.set_online(false);
    let worker = PortWorker::new("sim0", sim_connector(&bus), test_config());
    worker.start().unwrap();
    assert!(wait_until(WAIT, || worker.state() == PortState::Reconnecting));

    // No retries at all: only the free first miss keeps it from failing at once
    let (tx, rx) = mpsc::channel();
    let command = Command::new("sim0#12", 12, CommandKind::GetErrors, Priority::Normal)
        .with_max_retries(0)
        .with_callback(move |value| {
            let _ = tx.send(value);
        });
    worker.submit(command).unwrap();

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), None);
    let stats = worker.stats();
    assert_eq!(stats.failed_attempts, 2);
    assert_eq!(stats.commands_failed, 1);
    // Reconnecting stays with housekeeping
    assert_eq!(bus.connect_count(), 0);
    worker.stop();
}

#[test]
fn test_write_only_command_acknowledged() {
    let bus = two_controller_bus();
    let worker = PortWorker::new("sim0", sim_connector(&bus), test_config());
    worker.start().unwrap();

    let (tx, rx) = mpsc::channel();
    let command = Command::new(
        "sim0#12",
        12,
        CommandKind::SetSpeed {
            channel: 1,
            speed: 140,
        },
        Priority::Realtime,
    )
    .with_callback(move |value| {
        let _ = tx.send(value);
    });
    worker.submit(command).unwrap();

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), Some(Response::Ack));
    assert_eq!(bus.controller(12).unwrap().speeds[1], 140);
    worker.stop();
}

#[test]
fn test_short_reply_counted_as_malformed() {
    let bus = two_controller_bus();
    bus.set_short_replies(true);
    let manager = PortManager::new(test_config());
    let head = manager.controller_with("sim0", || sim_connector(&bus), 12).unwrap();

    assert_eq!(head.get_position_sync(0, Duration::from_millis(100)), None);
    let worker = head.worker().clone();
    assert!(wait_until(WAIT, || worker.pending_responses() == 0));
    let stats = worker.stats();
    assert_eq!(stats.responses_malformed, 1);
    assert_eq!(stats.responses_matched, 0);
    // A short reply is not retried
    assert_eq!(bus.frames().len(), 1);
}

#[test]
fn test_reconnects_after_unplug() {
    let bus = two_controller_bus();
    bus.set_online(false);
    let manager = PortManager::new(test_config());
    let head = manager.controller_with("sim0", || sim_connector(&bus), 12).unwrap();
    let worker = head.worker().clone();

    assert!(wait_until(WAIT, || worker.state() == PortState::Reconnecting));
    bus.set_online(true);
    assert!(wait_until(WAIT, || worker.is_connected()));
    assert_eq!(worker.state(), PortState::Running);

    bus.set_online(false);
    assert!(head.set_target(0, 1200.0, Priority::Normal));
    assert!(wait_until(WAIT, || !worker.is_connected()));
    bus.set_online(true);
    assert!(wait_until(WAIT, || worker.is_connected()));
    assert_eq!(bus.connect_count(), 2);

    assert_eq!(head.get_position_sync(0, Duration::from_millis(200)), Some(0.0));
}

#[test]
fn test_shutdown_fails_queued_commands() {
    let bus = two_controller_bus();
    let manager = PortManager::new(test_config());
    let head = manager.controller_with("sim0", || sim_connector(&bus), 12).unwrap();

    block_worker(&bus, &head);
    let nones = Arc::new(AtomicUsize::new(0));
    for channel in 1..4 {
        let nones = nones.clone();
        head.get_position(
            channel,
            move |value| {
                if value.is_none() {
                    nones.fetch_add(1, Ordering::SeqCst);
                }
            },
            Priority::Low,
        );
    }

    manager.shutdown_all();
    assert_eq!(nones.load(Ordering::SeqCst), 3);
    assert_eq!(manager.port_count(), 0);
    assert!(!head.worker().is_running());
    assert_eq!(head.worker().state(), PortState::Stopped);

    // The handle outlives its worker; submissions fail fast
    let (tx, rx) = mpsc::channel();
    assert!(!head.get_position(
        0,
        move |value| {
            let _ = tx.send(value);
        },
        Priority::Normal
    ));
    assert_eq!(rx.try_recv().unwrap(), None);
}

#[test]
fn test_stop_detaches_busy_worker_then_recovers() {
    let bus = two_controller_bus();
    bus.set_silent(true);
    let config = BusConfig {
        stop_join_timeout_ms: 50,
        ..test_config()
    };
    let worker = PortWorker::new("sim0", sim_connector(&bus), config);
    worker.start().unwrap();

    // Blocks the worker in a read well past the stop timeout
    let (tx, rx) = mpsc::channel();
    let read = Command::new(
        "sim0#12",
        12,
        CommandKind::GetPosition { channel: 0 },
        Priority::Normal,
    )
    .with_timeout(Duration::from_millis(400))
    .with_callback(move |value| {
        let _ = tx.send(value);
    });
    worker.submit(read).unwrap();
    assert!(wait_until(WAIT, || bus.frames().len() == 1));

    let started = Instant::now();
    worker.stop();
    assert!(started.elapsed() < Duration::from_millis(300));
    assert_eq!(worker.state(), PortState::Stopped);
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), None);

    // Once its read ends the detached thread exits and the port can start again
    assert!(wait_until(WAIT, || worker.start().is_ok()));
    bus.set_silent(false);
    assert!(wait_until(WAIT, || worker.is_connected()));
    let write = Command::new(
        "sim0#12",
        12,
        CommandKind::SetTarget {
            channel: 0,
            target: 1000.0,
        },
        Priority::Normal,
    );
    worker.submit(write).unwrap();
    assert!(wait_until(WAIT, || bus.target(12, 0) == Some(1000.0)));
    worker.stop();
    assert_eq!(bus.connect_count(), 2);
}

#[test]
fn test_last_worker_handle_dropped_in_callback() {
    let bus = two_controller_bus();
    bus.set_silent(true);
    let worker = Arc::new(PortWorker::new("sim0", sim_connector(&bus), test_config()));
    worker.start().unwrap();

    // Hold the worker in a silent read so the write below waits in the queue
    let read = Command::new(
        "sim0#12",
        12,
        CommandKind::GetPosition { channel: 0 },
        Priority::Normal,
    )
    .with_timeout(Duration::from_millis(200));
    worker.submit(read).unwrap();
    assert!(wait_until(WAIT, || bus.frames().len() == 1));

    let held = worker.clone();
    let (tx, rx) = mpsc::channel();
    let write = Command::new(
        "sim0#12",
        12,
        CommandKind::SetTarget {
            channel: 1,
            target: 1100.0,
        },
        Priority::Normal,
    )
    .with_callback(move |value| {
        // Last reference: stopping here must not wait on this very thread
        drop(held);
        let _ = tx.send(value);
    });
    worker.submit(write).unwrap();
    drop(worker);

    // Well under the two second stop timeout
    let value = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert!(value.is_some());
    assert_eq!(bus.target(12, 1), Some(1100.0));
}

#[test]
fn test_concurrent_attach_with_same_id() {
    let bus = two_controller_bus();
    let manager = PortManager::new(test_config());
    manager.get_or_create_with("sim0", || sim_connector(&bus)).unwrap();
    let worker = manager.get("sim0").unwrap();

    for round in 0..50u8 {
        let attempts: Vec<_> = [20u8, 40]
            .into_iter()
            .map(|number| {
                let worker = worker.clone();
                std::thread::spawn(move || {
                    ServoController::attach(worker, "arm", number + round % 10)
                })
            })
            .collect();
        let handles: Vec<ServoController> = attempts
            .into_iter()
            .filter_map(|t| t.join().unwrap().ok())
            .collect();
        assert_eq!(handles.len(), 1);
        assert_eq!(worker.registry().len(), 1);
        drop(handles);
        assert!(worker.registry().is_empty());
    }
}

#[test]
fn test_stopped_worker_restarts() {
    let bus = two_controller_bus();
    let manager = PortManager::new(test_config());
    let head = manager.controller_with("sim0", || sim_connector(&bus), 12).unwrap();
    let worker = head.worker().clone();

    worker.stop();
    assert!(!head.set_target(0, 1000.0, Priority::Normal));

    let again = manager.get_or_create_with("sim0", || sim_connector(&bus)).unwrap();
    assert!(Arc::ptr_eq(&again, &worker));
    assert!(worker.is_running());
    assert!(head.set_target(0, 1000.0, Priority::Normal));
    assert!(wait_until(WAIT, || bus.target(12, 0) == Some(1000.0)));
}

#[test]
fn test_port_stats() {
    let bus = two_controller_bus();
    let manager = PortManager::new(test_config());
    let a = manager.controller_with("sim0", || sim_connector(&bus), 12).unwrap();
    let _b = ServoController::attach(manager.get("sim0").unwrap(), "wrist", 13).unwrap();

    bus.set_position(12, 2, 1234.5);
    assert_eq!(a.get_position_sync(2, Duration::from_millis(200)), Some(1234.5));
    assert!(a.set_target(2, 1500.0, Priority::Normal));
    assert!(wait_until(WAIT, || bus.target(12, 2) == Some(1500.0)));

    let stats = manager.port_stats("sim0").unwrap();
    assert_eq!(stats.port, "sim0");
    assert_eq!(stats.state, PortState::Running);
    assert!(stats.connected);
    assert!(stats.started_at.is_some());
    assert_eq!(stats.registered_devices, vec!["sim0#12".to_string(), "wrist".to_string()]);
    assert_eq!(stats.device_numbers.get(&13).map(String::as_str), Some("wrist"));
    assert_eq!(stats.commands_processed, 2);
    assert_eq!(stats.commands_failed, 0);
    assert_eq!(stats.responses_matched, 1);
    assert_eq!(stats.success_rate, 100.0);
    assert_eq!(stats.queue_depth, 0);

    let json = serde_json::to_value(&stats).unwrap();
    assert_eq!(json["state"], "running");
    assert!(matches!(
        manager.port_stats("missing"),
        Err(BusError::UnknownPort(_))
    ));
    assert_eq!(manager.stats().len(), 1);
}
