// SPDX-License-Identifier: Apache-2.0 OR MIT
// SPDX-FileCopyrightText: © 2024 Google

use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use nix::errno::Errno;
use parking_lot::Condvar;
use parking_lot::Mutex;
use test_log::test;

use super::*;
use crate::ucsi::AckCcCi;
use crate::ucsi::Command;
use crate::ucsi::CommandCode;
use crate::ucsi::UCSI_CCI_OFFSET;
use crate::ucsi::UCSI_MESSAGE_IN_OFFSET;
use crate::ucsi::UCSI_VERSION_OFFSET;
use crate::BitWriter;
use crate::ToBytes;

const WAIT: Duration = Duration::from_secs(2);

enum Reply {
    /// MESSAGE_IN contents.
    Data(Vec<u8>),
    /// Only a byte count.
    Len(usize),
    Errno(Errno),
}

#[derive(Default)]
struct FakeState {
    replies: VecDeque<Reply>,
    executed: Vec<Control>,
}

/// An LPM whose commands block until the test queues a reply.
#[derive(Clone)]
struct FakeLpm {
    inner: Arc<(Mutex<FakeState>, Condvar)>,
    ports: u8,
}

impl FakeLpm {
    fn new(ports: u8) -> Self {
        Self {
            inner: Arc::new((Mutex::new(FakeState::default()), Condvar::new())),
            ports,
        }
    }

    fn reply(&self, reply: Reply) {
        let (state, changed) = &*self.inner;
        state.lock().replies.push_back(reply);
        changed.notify_all();
    }

    fn executed(&self) -> Vec<Control> {
        self.inner.0.lock().executed.clone()
    }

    fn calls(&self) -> usize {
        self.inner.0.lock().executed.len()
    }

    fn wait_for_calls(&self, calls: usize) {
        let (state, changed) = &*self.inner;
        let deadline = Instant::now() + WAIT;
        let mut state = state.lock();
        while state.executed.len() < calls {
            if changed.wait_until(&mut state, deadline).timed_out() {
                panic!("LPM saw {} calls, expected {calls}", state.executed.len());
            }
        }
    }
}

impl LpmDriver for FakeLpm {
    fn execute_cmd(&mut self, control: &Control, message_in: &mut [u8]) -> Result<usize> {
        let (state, changed) = &*self.inner;
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut state = state.lock();
        state.executed.push(*control);
        changed.notify_all();

        let reply = loop {
            if let Some(reply) = state.replies.pop_front() {
                break reply;
            }
            if changed.wait_until(&mut state, deadline).timed_out() {
                return Err(Error::TimeoutError {
                    #[cfg(feature = "backtrace")]
                    backtrace: std::backtrace::Backtrace::capture(),
                });
            }
        };

        match reply {
            Reply::Data(data) => {
                message_in[..data.len()].copy_from_slice(&data);
                Ok(data.len())
            }
            Reply::Len(len) => Ok(len),
            Reply::Errno(errno) => Err(errno.into()),
        }
    }

    fn active_port_count(&mut self) -> Result<u8> {
        Ok(self.ports)
    }
}

fn connector_status_reply(change: ConnectorStatusChange) -> Reply {
    let mut data = vec![0u8; crate::ucsi::UCSI_CONNECTOR_STATUS_SIZE];
    data[..2].copy_from_slice(&change.bits().to_le_bytes());
    Reply::Data(data)
}

fn control_bytes(control: &Control) -> [u8; UCSI_CONTROL_SIZE] {
    let mut buf = [0u8; UCSI_CONTROL_SIZE];
    control
        .to_bytes(&mut BitWriter::new(Cursor::new(&mut buf[..])))
        .unwrap();
    buf
}

fn eventually(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// A PPM on a [`FakeLpm`] whose notifications are collected as CCI
/// snapshots.
struct Harness {
    ppm: Ppm,
    lpm: FakeLpm,
    notifications: mpsc::Receiver<Cci>,
}

impl Harness {
    fn new(lpm: FakeLpm, config: PpmConfig) -> Self {
        let ppm = Ppm::new(lpm.clone(), config).unwrap();
        let (tx, notifications) = mpsc::channel();
        let tx = Mutex::new(tx);
        let handle = ppm.handle();
        assert!(!ppm.register_notify(move || {
            let _ = tx.lock().send(handle.cci());
        }));

        Self {
            ppm,
            lpm,
            notifications,
        }
    }

    /// An initialized PPM in the IDLE state.
    fn start(ports: u8) -> Self {
        let lpm = FakeLpm::new(ports);
        lpm.reply(Reply::Len(0));
        let mut harness = Self::new(lpm, PpmConfig::default());
        harness.ppm.init_and_wait().unwrap();
        assert_eq!(harness.ppm.state(), PpmState::Idle);
        harness
    }

    /// An initialized PPM in the IDLE_NOTIFY state.
    fn start_notifying(ports: u8, mask: NotificationEnable) -> Self {
        let harness = Self::start(ports);
        harness.enable_notifications(mask);
        harness
    }

    fn write(&self, command: &Command) {
        let control = Control::from_command(command).unwrap();
        self.ppm
            .write(UCSI_CONTROL_OFFSET, &control_bytes(&control))
            .unwrap();
    }

    fn ack(&self, command_complete_ack: bool, connector_change_ack: bool) {
        self.write(&Command::AckCcCi(AckCcCi {
            connector_change_ack,
            command_complete_ack,
        }));
    }

    fn next_cci(&self) -> Cci {
        self.notifications
            .recv_timeout(WAIT)
            .expect("no OPM notification")
    }

    fn expect_busy(&self) {
        let cci = self.next_cci();
        assert!(cci.busy, "{cci:?}");
        assert!(!cci.cmd_complete, "{cci:?}");
    }

    fn assert_quiet(&self) {
        let res = self.notifications.recv_timeout(Duration::from_millis(100));
        assert!(res.is_err(), "unexpected notification {res:?}");
    }

    fn message_in(&self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.ppm.read(UCSI_MESSAGE_IN_OFFSET, &mut buf).unwrap();
        buf
    }

    fn enable_notifications(&self, mask: NotificationEnable) {
        self.write(&Command::SetNotificationEnable { mask });
        self.expect_busy();
        let cci = self.next_cci();
        assert!(cci.cmd_complete && !cci.error, "{cci:?}");

        self.ack(true, false);
        let cci = self.next_cci();
        assert!(cci.ack_command, "{cci:?}");
        assert_eq!(self.ppm.state(), PpmState::IdleNotify);
    }

    /// Runs a command the LPM answers with `reply` and checks CCI.
    fn run_command(&self, command: &Command, reply: Reply) -> Cci {
        self.lpm.reply(reply);
        self.run_local_command(command)
    }

    /// Runs a command the PPM answers without the LPM.
    fn run_local_command(&self, command: &Command) -> Cci {
        self.write(command);
        self.expect_busy();
        let cci = self.next_cci();
        assert!(cci.cmd_complete, "{cci:?}");
        assert_eq!(self.ppm.state(), PpmState::WaitingCcAck);
        cci
    }

    fn ack_command_complete(&self) {
        self.ack(true, false);
        let cci = self.next_cci();
        assert!(cci.ack_command && !cci.error, "{cci:?}");
        assert_eq!(self.ppm.state(), PpmState::IdleNotify);
    }

    /// Raises a connector change on `port` and checks it is reported.
    fn connector_change(&self, port: u8, change: ConnectorStatusChange) {
        self.lpm.reply(connector_status_reply(change));
        self.ppm.lpm_alert(port);
        let cci = self.next_cci();
        assert_eq!(
            cci,
            Cci {
                connector_changed: port,
                ..Default::default()
            }
        );
        assert_eq!(self.ppm.state(), PpmState::WaitingAsyncEvAck);
    }
}

fn mask(bits: u32) -> NotificationEnable {
    NotificationEnable::from_bits_retain(bits)
}

#[test]
fn test_init_resets_lpm() {
    let harness = Harness::start(2);

    let executed = harness.lpm.executed();
    assert_eq!(executed.len(), 1);
    assert!(executed[0].is_command(CommandCode::PpmReset));
    assert_eq!(harness.ppm.num_ports(), 2);
    assert_eq!(harness.ppm.cci(), Cci::default());
    assert!(harness.ppm.is_running());
    harness.assert_quiet();
}

#[test]
fn test_version_region() {
    let harness = Harness::start(1);

    let mut version = [0u8; 4];
    harness.ppm.read(UCSI_VERSION_OFFSET, &mut version).unwrap();
    assert_eq!(version, [0x00, 0x03, 0x00, 0x00]);
}

#[test]
fn test_invalid_port_count() {
    for ports in [0, UCSI_MAX_PORTS + 1] {
        let res = Ppm::new(FakeLpm::new(ports), PpmConfig::default());
        assert!(matches!(res, Err(Error::InvalidPortCount { .. })));
    }
}

#[test]
fn test_startup_reset_failure_then_retry() {
    let lpm = FakeLpm::new(1);
    lpm.reply(Reply::Errno(Errno::EIO));
    let config = PpmConfig {
        init_timeout: Duration::from_millis(100),
        ..Default::default()
    };
    let mut harness = Harness::new(lpm, config);

    let res = harness.ppm.init_and_wait();
    assert!(matches!(res, Err(Error::TimeoutError { .. })));
    assert_eq!(harness.ppm.state(), PpmState::NotReady);

    // Anything but a reset is dropped.
    harness.write(&Command::GetCapability);
    eventually("dropped command", || !harness.ppm.is_command_pending());
    assert_eq!(harness.lpm.calls(), 1);
    harness.assert_quiet();

    harness.lpm.reply(Reply::Len(0));
    harness.write(&Command::PpmReset);
    let cci = harness.next_cci();
    assert!(cci.reset_completed, "{cci:?}");
    assert_eq!(harness.ppm.state(), PpmState::Idle);
    assert_eq!(harness.lpm.calls(), 2);
}

#[test]
fn test_enable_notifications_and_ack() {
    let harness = Harness::start(1);

    harness.write(&Command::SetNotificationEnable { mask: mask(0x8001) });
    harness.expect_busy();
    let cci = harness.next_cci();
    assert!(cci.cmd_complete, "{cci:?}");
    assert!(!cci.busy && !cci.error, "{cci:?}");
    assert_eq!(cci.data_length, 0);
    assert_eq!(harness.ppm.state(), PpmState::WaitingCcAck);

    harness.ack(true, false);
    let cci = harness.next_cci();
    assert!(cci.ack_command, "{cci:?}");
    assert!(!cci.cmd_complete, "{cci:?}");
    assert_eq!(harness.ppm.state(), PpmState::IdleNotify);

    // Handled entirely by the PPM.
    assert_eq!(harness.lpm.calls(), 1);
    harness.assert_quiet();
}

#[test]
fn test_connector_change_is_reported() {
    let harness = Harness::start_notifying(1, mask(0x8001));
    let change = ConnectorStatusChange::from_bits_retain(1);

    harness.connector_change(1, change);
    harness.assert_quiet();

    let query = harness.lpm.executed()[1];
    assert!(query.is_command(CommandCode::GetConnectorStatus));
    assert_eq!(query.connector_nr(), 1);
    assert!(!harness.ppm.is_async_event_pending());

    let (port, status) = harness.ppm.get_next_connector_status().unwrap();
    assert_eq!(port, 1);
    assert_eq!(status.connector_status_change, change);
    // Peeking does not consume the change.
    assert_eq!(harness.ppm.last_connector_changed(), 1);
}

#[test]
fn test_connector_change_ack() {
    let harness = Harness::start_notifying(1, mask(0x8001));
    harness.connector_change(1, ConnectorStatusChange::from_bits_retain(1));

    harness.ack(false, true);
    let cci = harness.next_cci();
    assert!(cci.ack_command, "{cci:?}");
    assert_eq!(cci.connector_changed, 0);
    assert_eq!(harness.ppm.state(), PpmState::IdleNotify);
    assert_eq!(harness.ppm.last_connector_changed(), 0);
    assert_eq!(
        harness.ppm.connector_status(1).unwrap().connector_status_change,
        ConnectorStatusChange::empty()
    );
    assert!(harness.ppm.get_next_connector_status().is_none());

    // The re-armed async event finds nothing left to report.
    eventually("async event", || !harness.ppm.is_async_event_pending());
    harness.assert_quiet();
    assert_eq!(harness.lpm.calls(), 2);
}

#[test]
fn test_repeated_command_instead_of_ack() {
    let harness = Harness::start_notifying(1, NotificationEnable::all());

    let caps = vec![0xa5; 16];
    let cci = harness.run_command(&Command::GetCapability, Reply::Data(caps.clone()));
    assert_eq!(cci.data_length, 16);
    assert_eq!(harness.message_in(16), caps);

    harness.write(&Command::GetCapability);
    let cci = harness.next_cci();
    assert!(cci.error && cci.cmd_complete, "{cci:?}");
    assert_eq!(harness.ppm.state(), PpmState::WaitingCcAck);
    assert_eq!(harness.lpm.calls(), 2);

    harness.ack_command_complete();
}

#[test]
fn test_lpm_failure() {
    let harness = Harness::start_notifying(1, NotificationEnable::all());
    let command = Command::GetConnectorCapability { connector_nr: 1 };

    harness.lpm.reply(Reply::Errno(Errno::EPERM));
    harness.write(&command);
    harness.expect_busy();
    let cci = harness.next_cci();
    assert!(cci.error && cci.cmd_complete, "{cci:?}");
    assert_eq!(harness.ppm.state(), PpmState::WaitingCcAck);
    assert_eq!(harness.ppm.last_error_origin(), ErrorOrigin::Lpm);
    harness.ack_command_complete();

    // The LPM is asked for the details.
    let details = vec![0x20, 0, 0, 0];
    let cci = harness.run_command(
        &Command::GetErrorStatus { connector_nr: 1 },
        Reply::Data(details.clone()),
    );
    assert_eq!(cci.data_length, 4);
    assert_eq!(harness.message_in(4), details);
    assert!(harness.lpm.executed()[2].is_command(CommandCode::GetErrorStatus));
    harness.ack_command_complete();

    let cci = harness.run_command(&command, Reply::Len(0));
    assert!(!cci.error, "{cci:?}");
}

#[test]
fn test_single_command_in_flight() {
    let harness = Harness::start_notifying(1, NotificationEnable::all());
    let command = Control::from_command(&Command::GetCableProperty { connector_nr: 1 }).unwrap();

    harness
        .ppm
        .write(UCSI_CONTROL_OFFSET, &control_bytes(&command))
        .unwrap();

    // Rejected while pending, before the worker picks it up or after.
    let other = Control::from_command(&Command::GetCapability).unwrap();
    let res = harness.ppm.write(UCSI_CONTROL_OFFSET, &control_bytes(&other));
    assert!(matches!(res, Err(Error::Busy { .. })));

    harness.expect_busy();
    harness.lpm.wait_for_calls(2);

    let res = harness.ppm.write(UCSI_CONTROL_OFFSET, &control_bytes(&other));
    assert!(matches!(res, Err(Error::Busy { .. })));

    let mut control = [0u8; UCSI_CONTROL_SIZE];
    harness.ppm.read(UCSI_CONTROL_OFFSET, &mut control).unwrap();
    assert_eq!(control, control_bytes(&command));

    // Alerts and reads go through while the LPM is busy.
    harness.ppm.lpm_alert(1);
    assert!(harness.ppm.is_async_event_pending());
    assert!(harness.ppm.cci().busy);

    harness.lpm.reply(Reply::Len(0));
    let cci = harness.next_cci();
    assert!(cci.cmd_complete && !cci.busy, "{cci:?}");
    assert_eq!(harness.lpm.executed()[1], command);

    // CONTROL is consumed.
    harness.ppm.read(UCSI_CONTROL_OFFSET, &mut control).unwrap();
    assert_eq!(control, [0u8; UCSI_CONTROL_SIZE]);

    // The alert waits for the ack.
    harness.lpm.reply(connector_status_reply(ConnectorStatusChange::empty()));
    harness.ack_command_complete();
    harness.lpm.wait_for_calls(3);
    eventually("async event", || !harness.ppm.is_async_event_pending());
    harness.assert_quiet();
}

#[test]
fn test_idle_drops_commands() {
    let harness = Harness::start(1);

    for command in [
        Command::GetCapability,
        Command::AckCcCi(AckCcCi {
            connector_change_ack: true,
            command_complete_ack: true,
        }),
        Command::GetConnectorStatus { connector_nr: 1 },
    ] {
        harness.write(&command);
        eventually("dropped command", || !harness.ppm.is_command_pending());
    }

    assert_eq!(harness.ppm.cci(), Cci::default());
    assert_eq!(harness.ppm.data_region().control, Control::default());
    assert_eq!(harness.ppm.state(), PpmState::Idle);
    assert_eq!(harness.lpm.calls(), 1);
    harness.assert_quiet();
}

#[test]
fn test_idle_ignores_alerts() {
    let harness = Harness::start(1);

    harness.ppm.lpm_alert(1);
    eventually("async event", || !harness.ppm.is_async_event_pending());
    assert_eq!(harness.lpm.calls(), 1);
    assert_eq!(harness.ppm.last_connector_changed(), 0);
    harness.assert_quiet();
}

#[test]
fn test_connector_change_ack_without_change() {
    let harness = Harness::start_notifying(1, NotificationEnable::all());

    harness.ack(false, true);
    let cci = harness.next_cci();
    assert!(cci.error && cci.cmd_complete, "{cci:?}");
    assert_eq!(harness.ppm.state(), PpmState::IdleNotify);
    assert_eq!(harness.ppm.last_error_origin(), ErrorOrigin::Ppm);

    // Answered from the PPM's own error status.
    let cci = harness.run_local_command(&Command::GetErrorStatus { connector_nr: 1 });
    assert_eq!(cci.data_length, 4);
    assert_eq!(
        harness.message_in(4),
        ErrorStatus::INVALID_COMMAND_SPECIFIC_PARAM.bits().to_le_bytes()
    );
    assert_eq!(harness.lpm.calls(), 1);
}

#[test]
fn test_connector_change_after_rejected_ack() {
    let harness = Harness::start_notifying(1, NotificationEnable::all());

    harness.ack(false, true);
    let cci = harness.next_cci();
    assert!(cci.error && cci.cmd_complete, "{cci:?}");
    assert_eq!(harness.ppm.state(), PpmState::IdleNotify);

    // The change is reported on its own, without the earlier error.
    harness.connector_change(1, ConnectorStatusChange::CONNECT);
    assert_eq!(harness.ppm.last_connector_changed(), 1);
}

#[test]
fn test_empty_ack_is_rejected() {
    let harness = Harness::start_notifying(1, NotificationEnable::all());
    harness.run_command(&Command::GetCapability, Reply::Len(0));

    harness.ack(false, false);
    let cci = harness.next_cci();
    assert!(cci.error, "{cci:?}");
    assert_eq!(harness.ppm.state(), PpmState::WaitingCcAck);
}

#[test]
fn test_command_complete_ack_while_change_owed() {
    let harness = Harness::start_notifying(1, NotificationEnable::all());
    harness.connector_change(1, ConnectorStatusChange::CONNECT);

    harness.ack(true, false);
    let cci = harness.next_cci();
    assert!(cci.error && cci.cmd_complete, "{cci:?}");
    assert_eq!(cci.connector_changed, 1);
    assert_eq!(harness.ppm.state(), PpmState::WaitingAsyncEvAck);
    assert_eq!(harness.ppm.last_connector_changed(), 1);
}

#[test]
fn test_command_while_change_owed() {
    let harness = Harness::start_notifying(1, NotificationEnable::all());
    harness.connector_change(1, ConnectorStatusChange::CONNECT);

    harness.lpm.reply(Reply::Len(0));
    harness.write(&Command::GetCapability);
    let cci = harness.next_cci();
    assert!(cci.busy, "{cci:?}");
    assert_eq!(cci.connector_changed, 1);
    let cci = harness.next_cci();
    assert!(cci.cmd_complete, "{cci:?}");
    assert_eq!(cci.connector_changed, 1);

    harness.ack(true, false);
    let cci = harness.next_cci();
    assert!(cci.ack_command, "{cci:?}");
    assert_eq!(cci.connector_changed, 1);
    assert_eq!(harness.ppm.state(), PpmState::IdleNotify);

    // The change is still owed an ack.
    harness.ack(false, true);
    harness.expect_busy();
    let cci = harness.next_cci();
    assert!(cci.ack_command, "{cci:?}");
    assert_eq!(cci.connector_changed, 0);
    assert_eq!(harness.ppm.last_connector_changed(), 0);
}

#[test]
fn test_reset_while_change_owed() {
    let harness = Harness::start_notifying(1, mask(0x8001));
    harness.connector_change(1, ConnectorStatusChange::from_bits_retain(1));

    harness.write(&Command::PpmReset);
    harness.expect_busy();
    let cci = harness.next_cci();
    assert!(cci.reset_completed, "{cci:?}");
    assert!(!cci.cmd_complete && !cci.error, "{cci:?}");

    assert_eq!(harness.ppm.state(), PpmState::Idle);
    assert_eq!(harness.ppm.last_connector_changed(), 0);
    assert_eq!(harness.ppm.last_error_origin(), ErrorOrigin::Lpm);
    assert!(!harness.ppm.is_command_pending());
    assert!(!harness.ppm.is_async_event_pending());
    assert_eq!(
        harness.ppm.connector_status(1).unwrap().connector_status_change,
        ConnectorStatusChange::empty()
    );
    // Handled by the PPM alone.
    assert_eq!(harness.lpm.calls(), 2);

    // Notifications are disabled again.
    harness.write(&Command::GetCapability);
    eventually("dropped command", || !harness.ppm.is_command_pending());
    harness.assert_quiet();
}

#[test]
fn test_reset_from_idle_states() {
    let harness = Harness::start(1);

    for enable in [false, true] {
        if enable {
            harness.enable_notifications(NotificationEnable::all());
        }

        harness.write(&Command::PpmReset);
        harness.expect_busy();
        let cci = harness.next_cci();
        assert!(cci.reset_completed, "{cci:?}");
        assert_eq!(cci.data_length, 0);
        assert_eq!(harness.ppm.state(), PpmState::Idle);
    }

    assert_eq!(harness.lpm.calls(), 1);
}

#[test]
fn test_reset_instead_of_ack() {
    let harness = Harness::start_notifying(1, NotificationEnable::all());
    harness.lpm.reply(Reply::Errno(Errno::EBUSY));
    harness.write(&Command::GetCapability);
    harness.expect_busy();
    assert!(harness.next_cci().error);
    assert_eq!(harness.ppm.last_error_origin(), ErrorOrigin::Ppm);

    harness.write(&Command::PpmReset);
    let cci = harness.next_cci();
    assert!(cci.reset_completed && !cci.error, "{cci:?}");
    assert_eq!(harness.ppm.state(), PpmState::Idle);
    assert_eq!(harness.ppm.last_error_origin(), ErrorOrigin::Lpm);
}

#[test]
fn test_data_length_wraps() {
    let harness = Harness::start_notifying(1, NotificationEnable::all());

    let cci = harness.run_command(&Command::GetCapability, Reply::Len(255));
    assert_eq!(cci.data_length, 255);
    harness.ack_command_complete();

    let cci = harness.run_command(&Command::GetCapability, Reply::Len(256));
    assert_eq!(cci.data_length, 0);
}

#[test]
fn test_unrecognized_commands() {
    let harness = Harness::start_notifying(1, NotificationEnable::all());

    for opcode in [0x00, CommandCode::MAX + 1, 0xff] {
        harness.ppm.write(UCSI_CONTROL_OFFSET, &[opcode]).unwrap();
        harness.expect_busy();
        let cci = harness.next_cci();
        assert!(cci.error && cci.cmd_complete && cci.not_supported, "{cci:?}");
        assert_eq!(harness.ppm.state(), PpmState::WaitingCcAck);
        harness.ack_command_complete();

        harness.run_local_command(&Command::GetErrorStatus { connector_nr: 1 });
        assert_eq!(
            harness.message_in(4),
            ErrorStatus::UNRECOGNIZED_COMMAND.bits().to_le_bytes()
        );
        harness.ack_command_complete();
    }

    assert_eq!(harness.lpm.calls(), 1);
}

#[test]
fn test_errno_classification() {
    let harness = Harness::start_notifying(2, NotificationEnable::all());

    let cases = [
        (
            Command::GetConnectorStatus { connector_nr: 9 },
            Errno::ERANGE,
            ErrorStatus::NON_EXISTENT_CONNECTOR_NUMBER,
        ),
        (
            Command::SetSinkPath {
                connector_nr: 1,
                enable: true,
            },
            Errno::EINVAL,
            ErrorStatus::SET_SINK_PATH_REJECTED,
        ),
        (
            Command::GetCurrentCam { connector_nr: 2 },
            Errno::EINVAL,
            ErrorStatus::INVALID_COMMAND_SPECIFIC_PARAM,
        ),
        (
            Command::Cancel,
            Errno::ETIMEDOUT,
            ErrorStatus::PPM_POLICY_CONFLICT,
        ),
    ];

    for (command, errno, status) in cases {
        harness.lpm.reply(Reply::Errno(errno));
        harness.write(&command);
        harness.expect_busy();
        assert!(harness.next_cci().error);
        harness.ack_command_complete();

        let calls = harness.lpm.calls();
        harness.run_local_command(&Command::GetErrorStatus { connector_nr: 1 });
        assert_eq!(harness.message_in(4), status.bits().to_le_bytes(), "{command:?}");
        assert_eq!(harness.lpm.calls(), calls);
        harness.ack_command_complete();
    }
}

#[test]
fn test_alerts_are_reported_one_port_at_a_time() {
    let change = ConnectorStatusChange::CONNECT;
    let harness = Harness::start_notifying(
        2,
        NotificationEnable::COMMAND_COMPLETE | NotificationEnable::CONNECT_CHANGE,
    );

    harness.lpm.reply(connector_status_reply(change));
    harness.lpm.reply(connector_status_reply(change));
    harness.ppm.lpm_alert(1);
    harness.ppm.lpm_alert(2);
    // Unknown port.
    harness.ppm.lpm_alert(3);

    let cci = harness.next_cci();
    assert_eq!(cci.connector_changed, 1);
    assert_eq!(harness.ppm.state(), PpmState::WaitingAsyncEvAck);
    // Port 2 waits for the ack.
    harness.assert_quiet();

    harness.ack(false, true);
    let cci = harness.next_cci();
    assert!(cci.ack_command, "{cci:?}");
    assert_eq!(cci.connector_changed, 0);

    let cci = harness.next_cci();
    assert_eq!(cci.connector_changed, 2);
    assert_eq!(harness.ppm.last_connector_changed(), 2);
    assert_eq!(harness.ppm.get_next_connector_status().unwrap().0, 2);

    let queried: Vec<u8> = harness.lpm.executed()[1..]
        .iter()
        .map(|control| control.connector_nr())
        .collect();
    assert_eq!(queried, [1, 2]);

    harness.ack(false, true);
    assert!(harness.next_cci().ack_command);
    harness.assert_quiet();
}

#[test]
fn test_masked_changes_are_cached() {
    let harness = Harness::start_notifying(
        2,
        NotificationEnable::COMMAND_COMPLETE | NotificationEnable::CONNECT_CHANGE,
    );

    harness.lpm.reply(connector_status_reply(
        ConnectorStatusChange::BATTERY_CHARGING_STATUS,
    ));
    harness.lpm.reply(connector_status_reply(ConnectorStatusChange::CONNECT));
    harness.ppm.lpm_alert(1);
    harness.ppm.lpm_alert(2);

    let cci = harness.next_cci();
    assert_eq!(cci.connector_changed, 2);
    harness.assert_quiet();
    assert_eq!(
        harness.ppm.connector_status(1).unwrap().connector_status_change,
        ConnectorStatusChange::BATTERY_CHARGING_STATUS
    );
}

#[test]
fn test_change_bits_accumulate() {
    let harness = Harness::start_notifying(1, NotificationEnable::all());
    harness.connector_change(1, ConnectorStatusChange::CONNECT);

    harness.lpm.reply(Reply::Len(0));
    harness.lpm.reply(connector_status_reply(
        ConnectorStatusChange::POWER_DIRECTION,
    ));
    harness.write(&Command::GetCapability);
    harness.expect_busy();
    assert!(harness.next_cci().cmd_complete);

    // An alert for the port already owed an ack refreshes its cache and
    // reports it again once the command is acked.
    harness.ppm.lpm_alert(1);
    harness.ack(true, false);
    assert!(harness.next_cci().ack_command);

    let cci = harness.next_cci();
    assert_eq!(cci.connector_changed, 1);
    assert_eq!(harness.ppm.state(), PpmState::WaitingAsyncEvAck);
    assert_eq!(
        harness.ppm.connector_status(1).unwrap().connector_status_change,
        ConnectorStatusChange::CONNECT | ConnectorStatusChange::POWER_DIRECTION
    );
}

#[test]
fn test_out_of_range_alerts_are_dropped() {
    let harness = Harness::start_notifying(2, NotificationEnable::all());

    harness.ppm.lpm_alert(0);
    harness.ppm.lpm_alert(3);
    harness.ppm.lpm_alert(UCSI_MAX_PORTS);
    assert!(!harness.ppm.is_async_event_pending());
    harness.assert_quiet();
    assert_eq!(harness.lpm.calls(), 1);
}

#[test]
fn test_read_bounds() {
    let harness = Harness::start(1);

    let mut region = vec![0u8; UCSI_MEMORY_REGION_SIZE];
    assert_eq!(harness.ppm.read(0, &mut region).unwrap(), UCSI_MEMORY_REGION_SIZE);

    let mut buf = [0u8; 2];
    assert_eq!(harness.ppm.read(UCSI_CCI_OFFSET + 1, &mut buf).unwrap(), 2);
    assert!(matches!(
        harness.ppm.read(UCSI_MEMORY_REGION_SIZE - 1, &mut buf),
        Err(Error::OutOfBounds { .. })
    ));
    assert!(matches!(
        harness.ppm.read(usize::MAX, &mut buf),
        Err(Error::OutOfBounds { .. })
    ));
}

#[test]
fn test_write_bounds() {
    let harness = Harness::start(1);

    for offset in [
        UCSI_VERSION_OFFSET,
        UCSI_CCI_OFFSET,
        UCSI_CONTROL_OFFSET + 1,
        UCSI_MESSAGE_IN_OFFSET,
        UCSI_MEMORY_REGION_SIZE,
    ] {
        assert!(
            matches!(
                harness.ppm.write(offset, &[0]),
                Err(Error::InvalidOffset { .. })
            ),
            "{offset}"
        );
    }

    assert!(matches!(
        harness.ppm.write(UCSI_CONTROL_OFFSET, &[]),
        Err(Error::InvalidLength { .. })
    ));
    assert!(matches!(
        harness.ppm.write(UCSI_CONTROL_OFFSET, &[0; UCSI_CONTROL_SIZE + 1]),
        Err(Error::InvalidLength { .. })
    ));
    assert!(matches!(
        harness.ppm.write(UCSI_MEMORY_REGION_SIZE - 4, &[0; 8]),
        Err(Error::OutOfBounds { .. })
    ));

    harness
        .ppm
        .write(UCSI_MESSAGE_OUT_OFFSET + 4, &[1, 2, 3])
        .unwrap();
    let mut buf = [0u8; 5];
    harness
        .ppm
        .read(UCSI_MESSAGE_OUT_OFFSET + 3, &mut buf)
        .unwrap();
    assert_eq!(buf, [0, 1, 2, 3, 0]);
    assert!(!harness.ppm.is_command_pending());
}

#[test]
fn test_short_control_write_is_padded() {
    let harness = Harness::start_notifying(1, NotificationEnable::all());

    harness.lpm.reply(Reply::Len(0));
    harness
        .ppm
        .write(UCSI_CONTROL_OFFSET, &[CommandCode::GetCapability as u8])
        .unwrap();
    harness.expect_busy();
    assert!(harness.next_cci().cmd_complete);

    assert_eq!(
        harness.lpm.executed()[1],
        Control {
            command: CommandCode::GetCapability as u8,
            ..Default::default()
        }
    );
}

#[test]
fn test_register_notify_replaces() {
    let harness = Harness::start(1);
    assert!(harness.ppm.register_notify(|| {}));

    harness.write(&Command::SetNotificationEnable {
        mask: NotificationEnable::all(),
    });
    eventually("command", || harness.ppm.state() == PpmState::WaitingCcAck);
    harness.assert_quiet();
}

#[test]
fn test_cleanup() {
    let mut harness = Harness::start(1);

    assert!(matches!(
        harness.ppm.init_and_wait(),
        Err(Error::AlreadyRunning { .. })
    ));

    harness.ppm.cleanup();
    assert!(!harness.ppm.is_running());
    // Idempotent.
    harness.ppm.cleanup();
}

#[test]
fn test_independent_instances() {
    let first = Harness::start_notifying(1, NotificationEnable::all());
    let second = Harness::start(1);

    first.run_command(&Command::GetCapability, Reply::Len(8));
    assert_eq!(second.ppm.state(), PpmState::Idle);
    assert_eq!(second.ppm.cci(), Cci::default());
    second.assert_quiet();
}

#[cfg(feature = "c_api")]
#[test]
fn test_c_register_notify() {
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    extern "C" fn count(context: *mut c_void) {
        let calls = unsafe { &*(context as *const AtomicU32) };
        calls.fetch_add(1, Ordering::SeqCst);
    }

    let harness = Harness::start(1);

    // NULL is refused and the current callback stays in place.
    assert_eq!(
        harness
            .ppm
            .ucsi_ppm_rs_register_notify(None, std::ptr::null_mut()),
        -nix::libc::EINVAL
    );
    harness.enable_notifications(NotificationEnable::all());

    let calls = Box::leak(Box::new(AtomicU32::new(0)));
    let context = calls as *const AtomicU32 as *mut c_void;
    assert_eq!(harness.ppm.ucsi_ppm_rs_register_notify(Some(count), context), 1);

    harness.lpm.reply(Reply::Len(0));
    harness.write(&Command::GetCapability);
    eventually("C notifications", || calls.load(Ordering::SeqCst) >= 2);
}
