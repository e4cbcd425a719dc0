// SPDX-License-Identifier: Apache-2.0 OR MIT
// SPDX-FileCopyrightText: © 2024 Google

//! The PPM worker: the UCSI state machine, the command dispatcher and the
//! async event handler.
//!
//! The worker is the only writer of the PPM state, the pending flags and the
//! connector status caches. It holds the PPM lock at all times except while
//! calling into the LPM driver and while notifying the OPM.

use std::io::Cursor;

use parking_lot::MutexGuard;

use super::PpmData;
use super::PpmState;
use super::Shared;
use crate::ucsi::CommandCode;
use crate::ucsi::ConnectorStatus;
use crate::ucsi::Control;
use crate::ucsi::ErrorStatus;
use crate::ucsi::UCSI_ERROR_STATUS_SIZE;
use crate::ucsi::UCSI_MESSAGE_IN_SIZE;
use crate::BitReader;
use crate::Error;
use crate::FromBytes;
use crate::LpmDriver;
use crate::Result;

type Guard<'a> = MutexGuard<'a, PpmData>;

/// The worker entry point. Returns once the PPM is cleaned up.
pub(super) fn run(shared: &Shared, driver: Box<dyn LpmDriver>) {
    let mut task = Task { driver, shared };
    let mut data = shared.data.lock();

    tracing::info!("PPM worker started");
    task.reset_lpm(&mut data);

    loop {
        while !data.cleaning_up && !data.has_work() {
            shared.work.wait(&mut data);
        }

        if data.cleaning_up {
            break;
        }

        task.step(&mut data);
    }

    tracing::info!("PPM worker exiting");
}

struct Task<'a> {
    driver: Box<dyn LpmDriver>,
    shared: &'a Shared,
}

impl Task<'_> {
    /// Runs one state machine iteration.
    fn step(&mut self, data: &mut Guard) {
        tracing::trace!(state = ?data.state, pending = ?data.pending, "PPM step");

        match data.state {
            PpmState::NotReady => {
                if data.pending.command {
                    if data.region.control.is_command(CommandCode::PpmReset) {
                        self.reset_lpm(data);
                        if data.state == PpmState::Idle {
                            data.clear_cci();
                            data.region.cci.reset_completed = true;
                            data.clear_pending_command();
                            notify_opm(data);
                            return;
                        }
                    } else {
                        tracing::debug!(
                            command = data.region.control.command,
                            "Dropping command, PPM is not ready"
                        );
                    }
                    data.clear_pending_command();
                } else {
                    data.pending.async_event = false;
                }
            }
            PpmState::Idle => {
                if data.pending.command {
                    let control = data.region.control;
                    if control.is_command(CommandCode::PpmReset)
                        || control.is_command(CommandCode::SetNotificationEnable)
                    {
                        self.handle_pending_command(data);
                    } else {
                        tracing::debug!(
                            command = control.command,
                            "Dropping command, notifications are disabled"
                        );
                        data.clear_pending_command();
                    }
                } else {
                    self.handle_async_event(data);
                }
            }
            PpmState::IdleNotify => {
                if data.pending.command {
                    let control = data.region.control;
                    if control.is_command(CommandCode::AckCcCi) && !is_valid_ack(data, &control) {
                        invalid_ack_notify(data);
                    } else {
                        self.handle_pending_command(data);
                    }
                } else {
                    self.handle_async_event(data);
                }
            }
            PpmState::ProcessingCommand => self.handle_pending_command(data),
            PpmState::WaitingCcAck => {
                if data.pending.command {
                    let control = data.region.control;
                    let is_reset = control.is_command(CommandCode::PpmReset);
                    let is_ack = control.is_command(CommandCode::AckCcCi);
                    if !is_reset && !(is_ack && is_valid_ack(data, &control)) {
                        invalid_ack_notify(data);
                    } else {
                        self.handle_pending_command(data);
                    }
                }
            }
            PpmState::WaitingAsyncEvAck => {
                if data.pending.command {
                    let control = data.region.control;
                    if control.is_command(CommandCode::AckCcCi) {
                        if is_valid_ack(data, &control) {
                            self.handle_pending_command(data);
                        } else {
                            invalid_ack_notify(data);
                        }
                    } else {
                        // Any other command is handled as if no ack was owed.
                        data.state = PpmState::IdleNotify;
                        self.handle_pending_command(data);
                    }
                }
            }
        }
    }

    /// Forwards a PPM_RESET to the LPM, the PPM becomes idle if it succeeds.
    fn reset_lpm(&mut self, data: &mut Guard) {
        let control = Control {
            command: CommandCode::PpmReset as u8,
            ..Default::default()
        };
        let mut message_in = [0u8; UCSI_MESSAGE_IN_SIZE];

        match self.execute_unlocked(data, &control, &mut message_in) {
            Ok(_) => {
                data.state = PpmState::Idle;
                tracing::info!("LPM reset, PPM is idle");
                self.shared.ready.notify_all();
            }
            Err(err) => tracing::error!(?err, "PPM_RESET failed, PPM is not ready"),
        }
    }

    fn handle_pending_command(&mut self, data: &mut Guard) {
        let control = data.region.control;
        let is_reset = control.is_command(CommandCode::PpmReset);
        let is_ack = control.is_command(CommandCode::AckCcCi);

        match data.state {
            PpmState::Idle | PpmState::IdleNotify | PpmState::ProcessingCommand => {
                if data.state != PpmState::ProcessingCommand {
                    data.state = PpmState::ProcessingCommand;
                    data.clear_cci();
                    data.region.cci.busy = true;
                    notify_opm(data);
                }

                let completed = self.execute_pending_command(data);
                let next = if !completed {
                    PpmState::WaitingCcAck
                } else if is_reset {
                    PpmState::Idle
                } else if is_ack {
                    data.clear_cci();
                    data.region.cci.ack_command = true;
                    PpmState::IdleNotify
                } else {
                    PpmState::WaitingCcAck
                };
                data.state = next;
            }
            PpmState::WaitingCcAck | PpmState::WaitingAsyncEvAck => {
                if self.execute_pending_command(data) {
                    if is_reset {
                        data.state = PpmState::Idle;
                    } else {
                        data.clear_cci();
                        data.region.cci.ack_command = true;
                        data.state = PpmState::IdleNotify;
                    }
                }
            }
            PpmState::NotReady => {
                tracing::error!("Cannot process commands before the PPM is ready");
                data.clear_pending_command();
                return;
            }
        }

        tracing::debug!(state = ?data.state, cci = ?data.region.cci, "Command handled");
        if data.state != PpmState::ProcessingCommand {
            data.pending.command = false;
        }
        notify_opm(data);
    }

    /// Consumes CONTROL, calling into the LPM at most once. Returns whether
    /// the command completed successfully. CCI is updated either way.
    fn execute_pending_command(&mut self, data: &mut Guard) -> bool {
        let control = data.region.control;
        let code = control.command_code();

        if !CommandCode::in_range(control.command) {
            tracing::warn!(command = control.command, "Unrecognized command");
            data.region.control = Control::default();
            data.set_ppm_error(ErrorStatus::UNRECOGNIZED_COMMAND);
            data.set_cci_error();
            data.region.cci.not_supported = true;
            return false;
        }

        let mut ack_connector_change = false;
        let result = match code {
            Some(CommandCode::AckCcCi) => {
                ack_connector_change = control.ack_cc_ci().connector_change_ack;
                Ok(0)
            }
            Some(CommandCode::GetErrorStatus) if data.last_error == super::ErrorOrigin::Ppm => {
                let payload = data.ppm_error_status.bits().to_le_bytes();
                data.region.message_in[..UCSI_ERROR_STATUS_SIZE].copy_from_slice(&payload);
                Ok(UCSI_ERROR_STATUS_SIZE)
            }
            Some(CommandCode::PpmReset) => {
                tracing::info!("Resetting PPM");
                data.reset();
                Ok(0)
            }
            Some(CommandCode::SetNotificationEnable) => {
                data.notification_mask = control.notification_enable();
                tracing::debug!(mask = ?data.notification_mask, "Notifications enabled");
                Ok(0)
            }
            _ => {
                let mut message_in = [0u8; UCSI_MESSAGE_IN_SIZE];
                let result = self.execute_unlocked(data, &control, &mut message_in);
                if let Ok(len) = result {
                    let len = len.min(UCSI_MESSAGE_IN_SIZE);
                    data.region.message_in[..len].copy_from_slice(&message_in[..len]);
                }
                result
            }
        };

        data.region.control = Control::default();

        match result {
            Ok(len) => {
                if ack_connector_change {
                    data.ack_connector_change();
                }

                data.clear_cci();
                if code == Some(CommandCode::PpmReset) {
                    data.region.cci.reset_completed = true;
                } else {
                    // The wire field is 8 bits wide, larger payloads wrap.
                    data.region.cci.data_length = (len & 0xff) as u8;
                    data.region.cci.cmd_complete = true;
                }
                true
            }
            Err(err) => {
                match classify_lpm_error(code, &err) {
                    Some(status) => {
                        tracing::error!(command = ?code, ?err, ?status, "Command failed");
                        data.set_ppm_error(status);
                    }
                    None => {
                        tracing::error!(command = ?code, ?err, "Command failed in the LPM");
                        data.set_lpm_error();
                    }
                }
                data.set_cci_error();
                false
            }
        }
    }

    /// Refreshes one alerted port and reports a connector change to the OPM
    /// if one is due.
    fn handle_async_event(&mut self, data: &mut Guard) {
        if !data.pending.async_event {
            return;
        }

        if matches!(data.state, PpmState::NotReady | PpmState::Idle) {
            tracing::trace!("Ignoring async event, notifications are disabled");
            data.pending.async_event = false;
            return;
        }

        let mut port_to_notify = None;
        if let Some(port) = data.pop_alerted_port() {
            self.refresh_port_status(data, port);
            if port == data.last_connector_changed {
                port_to_notify = Some(port);
            }
        }

        if data.last_connector_changed == 0 {
            port_to_notify = data.first_port_with_enabled_change();
        }

        // Remaining alerts are handled one by one.
        data.pending.async_event = data.alerted_ports != 0;

        if let Some(port) = port_to_notify {
            tracing::debug!(port, "Reporting connector change");
            data.last_connector_changed = port;
            data.clear_cci();
            data.state = PpmState::WaitingAsyncEvAck;
            notify_opm(data);
        }
    }

    fn refresh_port_status(&mut self, data: &mut Guard, port: u8) {
        let control = Control {
            command: CommandCode::GetConnectorStatus as u8,
            data_length: 0,
            command_specific: [port, 0, 0, 0, 0, 0],
        };
        let mut message_in = [0u8; UCSI_MESSAGE_IN_SIZE];

        if let Err(err) = self.execute_unlocked(data, &control, &mut message_in) {
            tracing::error!(port, ?err, "Could not read the connector status");
            return;
        }

        let mut reader = BitReader::new(Cursor::new(&message_in[..]));
        match ConnectorStatus::from_bytes(&mut reader) {
            Ok(status) => {
                tracing::debug!(port, change = ?status.connector_status_change, "Connector status");
                data.merge_port_status(port, status);
            }
            Err(err) => tracing::error!(port, ?err, "Could not parse the connector status"),
        }
    }

    /// Calls into the LPM with the PPM lock released.
    fn execute_unlocked(
        &mut self,
        data: &mut Guard,
        control: &Control,
        message_in: &mut [u8],
    ) -> Result<usize> {
        let driver = &mut self.driver;
        MutexGuard::unlocked(data, || driver.execute_cmd(control, message_in))
    }
}

/// Rings the OPM doorbell with the PPM lock released.
fn notify_opm(data: &mut Guard) {
    let cci = data.region.cci;
    match data.opm_notify.clone() {
        Some(notify) => {
            tracing::trace!(?cci, state = ?data.state, "Notifying OPM");
            MutexGuard::unlocked(data, || notify());
        }
        None => tracing::warn!(?cci, "No OPM notify callback registered"),
    }
}

fn is_valid_ack(data: &PpmData, control: &Control) -> bool {
    let ack = control.ack_cc_ci();

    if !ack.connector_change_ack && !ack.command_complete_ack {
        tracing::warn!("ACK_CC_CI acknowledges nothing");
        return false;
    }

    if ack.connector_change_ack && data.last_connector_changed == 0 {
        tracing::warn!("Connector change ack without a connector change");
        return false;
    }

    if ack.command_complete_ack && data.state != PpmState::WaitingCcAck {
        tracing::warn!(state = ?data.state, "Command complete ack without a completed command");
        return false;
    }

    true
}

/// Rejects the pending ACK_CC_CI. The state is left alone.
fn invalid_ack_notify(data: &mut Guard) {
    data.set_ppm_error(ErrorStatus::INVALID_COMMAND_SPECIFIC_PARAM);
    data.set_cci_error();
    data.clear_pending_command();
    notify_opm(data);
}

/// Maps errors the LPM driver returned to the PPM's own error status bits.
/// `None` means the LPM has to be asked for the details.
fn classify_lpm_error(command: Option<CommandCode>, err: &Error) -> Option<ErrorStatus> {
    match err {
        Error::NotSupported { .. } => Some(ErrorStatus::UNRECOGNIZED_COMMAND),
        Error::TimeoutError { .. } => Some(ErrorStatus::PPM_POLICY_CONFLICT),
        Error::NixError { source, .. } => classify_errno(command, *source as i32),
        Error::IoError { source, .. } => source
            .raw_os_error()
            .and_then(|errno| classify_errno(command, errno)),
        _ => None,
    }
}

fn classify_errno(command: Option<CommandCode>, errno: i32) -> Option<ErrorStatus> {
    use nix::libc;

    match errno {
        libc::EBUSY | libc::ETIMEDOUT => Some(ErrorStatus::PPM_POLICY_CONFLICT),
        libc::ERANGE => Some(ErrorStatus::NON_EXISTENT_CONNECTOR_NUMBER),
        libc::EINVAL if command == Some(CommandCode::SetSinkPath) => {
            Some(ErrorStatus::SET_SINK_PATH_REJECTED)
        }
        libc::EINVAL => Some(ErrorStatus::INVALID_COMMAND_SPECIFIC_PARAM),
        errno if errno == libc::ENOTSUP || errno == libc::EOPNOTSUPP => {
            Some(ErrorStatus::UNRECOGNIZED_COMMAND)
        }
        _ => None,
    }
}
