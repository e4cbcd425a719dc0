// SPDX-License-Identifier: Apache-2.0 OR MIT
// SPDX-FileCopyrightText: © 2024 Google

//! The Platform Policy Manager.
//!
//! A [`Ppm`] owns the UCSI memory region and a worker thread that runs the
//! UCSI state machine against an [`LpmDriver`]. The OPM side talks to it
//! through a [`PpmHandle`]: it writes commands into CONTROL, gets a doorbell
//! through the registered notify callback and reads CCI and MESSAGE_IN back.
//!
//! # Examples
//!
//! ```no_run
//! use ucsi_ppm_rs::drivers::ucsi_debugfs::UcsiDebugfsDriver;
//! use ucsi_ppm_rs::Ppm;
//! use ucsi_ppm_rs::PpmConfig;
//!
//! let driver = UcsiDebugfsDriver::new().unwrap();
//! let mut ppm = Ppm::new(driver, PpmConfig::default()).unwrap();
//! ppm.register_notify(|| println!("CCI changed"));
//! ppm.init_and_wait().unwrap();
//! ```

#[cfg(feature = "c_api")]
use std::ffi::c_int;
#[cfg(feature = "c_api")]
use std::ffi::c_void;
use std::io::Cursor;
use std::ops::Deref;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Condvar;
use parking_lot::Mutex;

#[cfg(feature = "c_api")]
use crate::drivers::c_driver::CDriver;
#[cfg(feature = "c_api")]
use crate::drivers::c_driver::UcsiPpmRsDriver;
use crate::ucsi::Cci;
use crate::ucsi::ConnectorStatus;
use crate::ucsi::ConnectorStatusChange;
use crate::ucsi::Control;
use crate::ucsi::ErrorStatus;
use crate::ucsi::NotificationEnable;
use crate::ucsi::UcsiMemoryRegion;
use crate::ucsi::UcsiVersion;
use crate::ucsi::UCSI_CONTROL_OFFSET;
use crate::ucsi::UCSI_CONTROL_SIZE;
use crate::ucsi::UCSI_MAX_PORTS;
use crate::ucsi::UCSI_MEMORY_REGION_SIZE;
use crate::ucsi::UCSI_MESSAGE_OUT_OFFSET;
use crate::ucsi::UCSI_VERSION;
use crate::BcdWrapper;
use crate::BitReader;
#[cfg(feature = "c_api")]
use crate::CError;
use crate::Error;
use crate::FromBytes;
use crate::LpmDriver;
use crate::Result;

mod task;
#[cfg(test)]
mod tests;

/// Configuration for a [`Ppm`] instance.
#[derive(Debug, Clone)]
pub struct PpmConfig {
    /// The UCSI version reported in the VERSION field, in BCD.
    pub version: u16,
    /// The LPM address reported in the VERSION field.
    pub lpm_address: u8,
    /// How long [`Ppm::init_and_wait`] waits for the startup reset.
    pub init_timeout: Duration,
}

impl Default for PpmConfig {
    fn default() -> Self {
        Self {
            version: UCSI_VERSION,
            lpm_address: 0,
            init_timeout: Duration::from_secs(1),
        }
    }
}

/// The states of the PPM.
///
/// The declaration order matters: async events are only processed in states
/// up to and including `IdleNotify`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PpmState {
    /// Waiting for the startup PPM_RESET to complete.
    NotReady,
    /// Notifications are disabled. Only PPM_RESET and SET_NOTIFICATION_ENABLE
    /// are accepted.
    Idle,
    /// Notifications are enabled and no acknowledgement is owed.
    IdleNotify,
    /// A command is being executed, CCI.busy is set.
    ProcessingCommand,
    /// A command completed, the OPM has to acknowledge it.
    WaitingCcAck,
    /// A connector change was reported, the OPM has to acknowledge it.
    WaitingAsyncEvAck,
}

/// Where the last error came from, which decides how GET_ERROR_STATUS is
/// answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorOrigin {
    /// The LPM is asked for the details. This is also the reset value.
    #[default]
    Lpm,
    /// The PPM answers from its cached error status.
    Ppm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Pending {
    /// The OPM wrote a command into CONTROL.
    pub(crate) command: bool,
    /// The LPM raised an alert.
    pub(crate) async_event: bool,
}

pub(crate) type NotifyFn = Arc<dyn Fn() + Send + Sync>;

/// Everything guarded by the PPM lock.
pub(crate) struct PpmData {
    pub(crate) state: PpmState,
    pub(crate) pending: Pending,
    pub(crate) cleaning_up: bool,
    pub(crate) num_ports: u8,
    /// Cached GET_CONNECTOR_STATUS data, indexed by port - 1.
    pub(crate) port_status: Vec<ConnectorStatus>,
    /// One bit per alerted port, bit 0 is port 1.
    pub(crate) alerted_ports: u128,
    /// The 1-based port that is owed a connector change ack, 0 if none.
    pub(crate) last_connector_changed: u8,
    pub(crate) last_error: ErrorOrigin,
    pub(crate) ppm_error_status: ErrorStatus,
    pub(crate) notification_mask: NotificationEnable,
    pub(crate) region: UcsiMemoryRegion,
    pub(crate) opm_notify: Option<NotifyFn>,
}

impl PpmData {
    fn new(num_ports: u8, config: &PpmConfig) -> Self {
        let mut region = UcsiMemoryRegion::default();
        region.version = UcsiVersion {
            version: BcdWrapper(u32::from(config.version)),
            lpm_address: config.lpm_address,
        };

        Self {
            state: PpmState::NotReady,
            pending: Pending::default(),
            cleaning_up: false,
            num_ports,
            port_status: vec![ConnectorStatus::default(); usize::from(num_ports)],
            alerted_ports: 0,
            last_connector_changed: 0,
            last_error: ErrorOrigin::default(),
            ppm_error_status: ErrorStatus::empty(),
            notification_mask: NotificationEnable::empty(),
            region,
            opm_notify: None,
        }
    }

    /// Whether the worker has something to do in the current state.
    pub(crate) fn has_work(&self) -> bool {
        self.state == PpmState::ProcessingCommand
            || self.pending.command
            || (self.pending.async_event && self.state <= PpmState::IdleNotify)
    }

    /// Clears all state a PPM_RESET is expected to clear.
    pub(crate) fn reset(&mut self) {
        self.pending = Pending::default();
        self.alerted_ports = 0;
        self.last_connector_changed = 0;
        self.last_error = ErrorOrigin::default();
        self.ppm_error_status = ErrorStatus::empty();
        self.notification_mask = NotificationEnable::empty();
        self.port_status.fill(ConnectorStatus::default());
    }

    /// Clears CCI, keeping the connector change that is still owed an ack.
    pub(crate) fn clear_cci(&mut self) {
        self.region.cci = Cci {
            connector_changed: self.last_connector_changed,
            ..Default::default()
        };
    }

    pub(crate) fn set_cci_error(&mut self) {
        self.clear_cci();
        self.region.cci.error = true;
        self.region.cci.cmd_complete = true;
    }

    pub(crate) fn set_ppm_error(&mut self, status: ErrorStatus) {
        self.last_error = ErrorOrigin::Ppm;
        self.ppm_error_status = status;
    }

    pub(crate) fn set_lpm_error(&mut self) {
        self.last_error = ErrorOrigin::Lpm;
        self.ppm_error_status = ErrorStatus::empty();
    }

    pub(crate) fn clear_pending_command(&mut self) {
        self.pending.command = false;
        self.region.control = Control::default();
    }

    /// Pops the lowest alerted port.
    pub(crate) fn pop_alerted_port(&mut self) -> Option<u8> {
        if self.alerted_ports == 0 {
            return None;
        }

        let bit = self.alerted_ports.trailing_zeros();
        self.alerted_ports &= !(1u128 << bit);
        Some(bit as u8 + 1)
    }

    /// Stores a fresh connector status, accumulating the change bits that
    /// have not been acknowledged yet.
    pub(crate) fn merge_port_status(&mut self, port: u8, status: ConnectorStatus) {
        let Some(cached) = self.port_status_mut(port) else {
            return;
        };

        let change = cached.connector_status_change | status.connector_status_change;
        *cached = status;
        cached.connector_status_change = change;
    }

    /// The first port with a change the OPM asked to be notified about.
    pub(crate) fn first_port_with_enabled_change(&self) -> Option<u8> {
        self.port_status
            .iter()
            .position(|status| {
                self.notification_mask
                    .allows(status.connector_status_change)
            })
            .map(|idx| idx as u8 + 1)
    }

    /// Side effect of a connector change ack: the owed port is done with and
    /// the next alerted port, if any, gets a chance to be reported.
    pub(crate) fn ack_connector_change(&mut self) {
        let port = self.last_connector_changed;
        if let Some(status) = self.port_status_mut(port) {
            status.connector_status_change = ConnectorStatusChange::empty();
        }

        self.last_connector_changed = 0;
        self.pending.async_event = true;
    }

    fn port_status_mut(&mut self, port: u8) -> Option<&mut ConnectorStatus> {
        let idx = usize::from(port.checked_sub(1)?);
        self.port_status.get_mut(idx)
    }
}

pub(crate) struct Shared {
    pub(crate) data: Mutex<PpmData>,
    /// Wakes the worker.
    pub(crate) work: Condvar,
    /// Signals that the worker left `NotReady`.
    pub(crate) ready: Condvar,
}

/// The interface of a PPM, shared between the OPM transport, the LPM alert
/// path and the notify callback.
///
/// All methods only hold the PPM lock briefly and never wait for a command
/// to complete.
#[derive(Clone)]
pub struct PpmHandle {
    shared: Arc<Shared>,
}

impl PpmHandle {
    /// Reads `buf.len()` bytes of the UCSI memory region at `offset`.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize> {
        let end = offset
            .checked_add(buf.len())
            .filter(|end| *end <= UCSI_MEMORY_REGION_SIZE)
            .ok_or_else(|| Error::OutOfBounds {
                offset,
                length: buf.len(),
                #[cfg(feature = "backtrace")]
                backtrace: std::backtrace::Backtrace::capture(),
            })?;

        let region = self.shared.data.lock().region.clone();
        let image = region.to_image()?;
        buf.copy_from_slice(&image[offset..end]);
        Ok(buf.len())
    }

    /// Writes `buf` into the UCSI memory region at `offset`.
    ///
    /// Only CONTROL and MESSAGE_OUT are writable. A CONTROL write schedules
    /// the command, and is rejected with [`Error::Busy`] while another
    /// command is pending or being processed.
    pub fn write(&self, offset: usize, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Err(Error::InvalidLength {
                length: 0,
                #[cfg(feature = "backtrace")]
                backtrace: std::backtrace::Backtrace::capture(),
            });
        }

        if offset == UCSI_CONTROL_OFFSET {
            return self.write_control(buf);
        }

        if (UCSI_MESSAGE_OUT_OFFSET..UCSI_MEMORY_REGION_SIZE).contains(&offset) {
            let end = offset + buf.len();
            if end > UCSI_MEMORY_REGION_SIZE {
                return Err(Error::OutOfBounds {
                    offset,
                    length: buf.len(),
                    #[cfg(feature = "backtrace")]
                    backtrace: std::backtrace::Backtrace::capture(),
                });
            }

            let start = offset - UCSI_MESSAGE_OUT_OFFSET;
            let mut data = self.shared.data.lock();
            data.region.message_out[start..start + buf.len()].copy_from_slice(buf);
            return Ok(());
        }

        tracing::warn!(offset, length = buf.len(), "Rejecting write to a read-only offset");
        Err(Error::InvalidOffset {
            offset,
            #[cfg(feature = "backtrace")]
            backtrace: std::backtrace::Backtrace::capture(),
        })
    }

    fn write_control(&self, buf: &[u8]) -> Result<()> {
        if buf.len() > UCSI_CONTROL_SIZE {
            return Err(Error::InvalidLength {
                length: buf.len(),
                #[cfg(feature = "backtrace")]
                backtrace: std::backtrace::Backtrace::capture(),
            });
        }

        // Short writes leave the rest of CONTROL zeroed.
        let mut raw = [0u8; UCSI_CONTROL_SIZE];
        raw[..buf.len()].copy_from_slice(buf);
        let control = Control::from_bytes(&mut BitReader::new(Cursor::new(&raw[..])))?;

        let mut data = self.shared.data.lock();
        if data.pending.command || data.region.cci.busy {
            tracing::warn!(
                command = control.command,
                pending = data.region.control.command,
                "Rejecting command, PPM is busy"
            );
            return Err(Error::Busy {
                #[cfg(feature = "backtrace")]
                backtrace: std::backtrace::Backtrace::capture(),
            });
        }

        data.region.control = control;
        data.pending.command = true;
        tracing::debug!(command = ?control.command_code(), state = ?data.state, "Command pending");
        self.shared.work.notify_one();
        Ok(())
    }

    /// Registers the doorbell invoked whenever CCI changes for the OPM.
    ///
    /// The callback runs on the worker thread with the PPM lock released, so
    /// it may call back into the handle. Returns true if an earlier callback
    /// was replaced.
    pub fn register_notify<F>(&self, notify: F) -> bool
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut data = self.shared.data.lock();
        let replaced = data.opm_notify.replace(Arc::new(notify)).is_some();
        if replaced {
            tracing::info!("Replaced the OPM notify callback");
        }
        replaced
    }

    /// Signals that something changed on the 1-based `port`.
    ///
    /// Safe to call from any thread at any time, including from within
    /// [`LpmDriver::execute_cmd`].
    pub fn lpm_alert(&self, port: u8) {
        let mut data = self.shared.data.lock();
        if port == 0 || port > data.num_ports {
            tracing::error!(port, num_ports = data.num_ports, "Dropping alert for unknown port");
            return;
        }

        data.alerted_ports |= 1u128 << (port - 1);
        data.pending.async_event = true;
        tracing::trace!(port, "LPM alert");
        self.shared.work.notify_one();
    }

    /// The port currently owed a connector change ack and its cached status.
    /// The alert is not consumed.
    pub fn get_next_connector_status(&self) -> Option<(u8, ConnectorStatus)> {
        let data = self.shared.data.lock();
        let port = data.last_connector_changed;
        let idx = usize::from(port.checked_sub(1)?);
        data.port_status.get(idx).map(|status| (port, status.clone()))
    }

    pub fn state(&self) -> PpmState {
        self.shared.data.lock().state
    }

    pub fn cci(&self) -> Cci {
        self.shared.data.lock().region.cci
    }

    pub fn num_ports(&self) -> u8 {
        self.shared.data.lock().num_ports
    }

    pub fn is_command_pending(&self) -> bool {
        self.shared.data.lock().pending.command
    }

    pub fn is_async_event_pending(&self) -> bool {
        self.shared.data.lock().pending.async_event
    }

    pub fn last_connector_changed(&self) -> u8 {
        self.shared.data.lock().last_connector_changed
    }

    pub fn last_error_origin(&self) -> ErrorOrigin {
        self.shared.data.lock().last_error
    }

    /// The cached status of the 1-based `port`.
    pub fn connector_status(&self, port: u8) -> Option<ConnectorStatus> {
        let idx = usize::from(port.checked_sub(1)?);
        self.shared.data.lock().port_status.get(idx).cloned()
    }

    /// A snapshot of the UCSI memory region.
    pub fn data_region(&self) -> UcsiMemoryRegion {
        self.shared.data.lock().region.clone()
    }
}

/// A PPM instance bound to one LPM.
///
/// Dereferences to its [`PpmHandle`]. Dropping it stops the worker.
pub struct Ppm {
    handle: PpmHandle,
    config: PpmConfig,
    /// Moved into the worker by `init_and_wait`.
    driver: Option<Box<dyn LpmDriver>>,
    worker: Option<JoinHandle<()>>,
}

impl Ppm {
    /// Creates a PPM for `driver`. The worker is not started until
    /// [`Ppm::init_and_wait`].
    pub fn new<D: LpmDriver + 'static>(mut driver: D, config: PpmConfig) -> Result<Self> {
        let num_ports = driver.active_port_count()?;
        if num_ports == 0 || num_ports > UCSI_MAX_PORTS {
            return Err(Error::InvalidPortCount {
                count: u32::from(num_ports),
                #[cfg(feature = "backtrace")]
                backtrace: std::backtrace::Backtrace::capture(),
            });
        }

        tracing::debug!(num_ports, ?config, "Creating PPM");
        let shared = Arc::new(Shared {
            data: Mutex::new(PpmData::new(num_ports, &config)),
            work: Condvar::new(),
            ready: Condvar::new(),
        });

        Ok(Self {
            handle: PpmHandle { shared },
            config,
            driver: Some(Box::new(driver)),
            worker: None,
        })
    }

    pub fn handle(&self) -> PpmHandle {
        self.handle.clone()
    }

    /// Starts the worker, which resets the LPM, and waits for the PPM to
    /// become idle.
    ///
    /// On timeout the worker keeps running in `NotReady`, where a PPM_RESET
    /// written by the OPM retries the reset.
    pub fn init_and_wait(&mut self) -> Result<()> {
        let driver = self.driver.take().ok_or_else(|| Error::AlreadyRunning {
            #[cfg(feature = "backtrace")]
            backtrace: std::backtrace::Backtrace::capture(),
        })?;

        let shared = Arc::clone(&self.handle.shared);
        let worker = std::thread::Builder::new()
            .name("ucsi-ppm".into())
            .spawn(move || task::run(&shared, driver))?;
        self.worker = Some(worker);

        let mut data = self.handle.shared.data.lock();
        self.handle.shared.ready.wait_while_for(
            &mut data,
            |data| data.state == PpmState::NotReady,
            self.config.init_timeout,
        );

        if data.state == PpmState::NotReady {
            tracing::error!(timeout = ?self.config.init_timeout, "PPM did not become ready");
            return Err(Error::TimeoutError {
                #[cfg(feature = "backtrace")]
                backtrace: std::backtrace::Backtrace::capture(),
            });
        }

        tracing::info!(num_ports = data.num_ports, "PPM ready");
        Ok(())
    }

    /// Whether the worker thread is running.
    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Stops the worker and waits for it. An in-flight LPM command is allowed
    /// to finish first.
    pub fn cleanup(&mut self) {
        {
            let mut data = self.handle.shared.data.lock();
            data.cleaning_up = true;
            // The callback may hold a handle to us.
            data.opm_notify = None;
            self.handle.shared.work.notify_one();
        }

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("PPM worker panicked");
            }
            tracing::info!("PPM worker stopped");
        }
    }
}

impl Deref for Ppm {
    type Target = PpmHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl Drop for Ppm {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(feature = "c_api")]
struct NotifyContext(*mut c_void);

// The C caller guarantees the context can be used from the worker thread.
#[cfg(feature = "c_api")]
unsafe impl Send for NotifyContext {}
#[cfg(feature = "c_api")]
unsafe impl Sync for NotifyContext {}

#[cfg(feature = "c_api")]
impl NotifyContext {
    fn as_ptr(&self) -> *mut c_void {
        self.0
    }
}

// The C API.
#[cfg(feature = "c_api")]
impl Ppm {
    #[no_mangle]
    /// Creates a PPM on top of `driver`.
    ///
    /// # Arguments
    /// `driver` The LPM driver vtable, see `UcsiPpmRsDriver`.
    /// `out_ppm` An opaque pointer that gets initialized with the new `Ppm`
    /// instance.
    ///
    /// # Safety
    /// The caller must call ucsi_ppm_rs_destroy() at a later point to free up
    /// any allocated resources.
    ///
    /// # Returns
    /// 0 on success, -errno on failure.
    extern "C" fn ucsi_ppm_rs_open(driver: UcsiPpmRsDriver, out_ppm: *mut *mut Self) -> c_int {
        match Self::new(CDriver::from(driver), PpmConfig::default()) {
            Ok(ppm) => {
                unsafe { *out_ppm = Box::into_raw(Box::new(ppm)) };
                0
            }
            Err(err) => {
                unsafe { *out_ppm = std::ptr::null_mut() };
                -CError::from(err).0
            }
        }
    }

    #[no_mangle]
    /// Starts the PPM and waits for it to become idle. Returns 0 on success,
    /// -errno on failure.
    extern "C" fn ucsi_ppm_rs_init_and_wait(&mut self) -> c_int {
        match self.init_and_wait() {
            Ok(()) => 0,
            Err(err) => -CError::from(err).0,
        }
    }

    #[no_mangle]
    /// Reads `length` bytes at `offset` of the UCSI memory region into `buf`.
    /// Returns the number of bytes read, -errno on failure.
    ///
    /// # Safety
    /// `buf` must be valid for `length` bytes.
    extern "C" fn ucsi_ppm_rs_read(&self, offset: usize, buf: *mut u8, length: usize) -> c_int {
        if buf.is_null() {
            return -nix::libc::EINVAL;
        }

        let buf = unsafe { std::slice::from_raw_parts_mut(buf, length) };
        match self.read(offset, buf) {
            Ok(read) => read as c_int,
            Err(err) => -CError::from(err).0,
        }
    }

    #[no_mangle]
    /// Writes `length` bytes from `buf` at `offset` of the UCSI memory
    /// region. Returns 0 on success, -errno on failure.
    ///
    /// # Safety
    /// `buf` must be valid for `length` bytes.
    extern "C" fn ucsi_ppm_rs_write(&self, offset: usize, buf: *const u8, length: usize) -> c_int {
        if buf.is_null() {
            return -nix::libc::EINVAL;
        }

        let buf = unsafe { std::slice::from_raw_parts(buf, length) };
        match self.write(offset, buf) {
            Ok(()) => 0,
            Err(err) => -CError::from(err).0,
        }
    }

    #[no_mangle]
    /// Registers `callback`, which gets called with `context` whenever CCI
    /// changes. Returns 1 if an earlier callback was replaced, 0 otherwise,
    /// or -EINVAL if `callback` is NULL.
    ///
    /// # Safety
    /// `context` must stay valid, and usable from another thread, until the
    /// PPM is destroyed or the callback replaced.
    extern "C" fn ucsi_ppm_rs_register_notify(
        &self,
        callback: Option<extern "C" fn(*mut c_void)>,
        context: *mut c_void,
    ) -> c_int {
        let Some(callback) = callback else {
            return -nix::libc::EINVAL;
        };
        let context = NotifyContext(context);
        c_int::from(self.register_notify(move || callback(context.as_ptr())))
    }

    #[no_mangle]
    /// Signals an LPM alert on the 1-based `port`.
    extern "C" fn ucsi_ppm_rs_lpm_alert(&self, port: u8) {
        self.lpm_alert(port)
    }

    #[no_mangle]
    /// Copies the port owed a connector change ack into `out_port` and its
    /// raw GET_CONNECTOR_STATUS data into `out_status`. Returns false if no
    /// port is owed an ack.
    ///
    /// # Safety
    /// `out_status` must be valid for `UCSI_CONNECTOR_STATUS_SIZE` bytes.
    extern "C" fn ucsi_ppm_rs_get_next_connector_status(
        &self,
        out_port: &mut u8,
        out_status: *mut u8,
    ) -> bool {
        use crate::ucsi::UCSI_CONNECTOR_STATUS_SIZE;
        use crate::ToBytes;

        let Some((port, status)) = self.get_next_connector_status() else {
            return false;
        };

        if out_status.is_null() {
            return false;
        }

        let out = unsafe { std::slice::from_raw_parts_mut(out_status, UCSI_CONNECTOR_STATUS_SIZE) };
        out.fill(0);
        let mut bw = crate::BitWriter::new(Cursor::new(out));
        if status.to_bytes(&mut bw).is_err() {
            return false;
        }

        *out_port = port;
        true
    }

    #[no_mangle]
    /// Stops and destroys the `ppm` instance.
    ///
    /// # Safety
    /// Must be called with a pointer that was previously acquired from
    /// ucsi_ppm_rs_open().
    extern "C" fn ucsi_ppm_rs_destroy(ppm: &mut Self) {
        let _ = unsafe { Box::from_raw(ppm) };
    }
}
