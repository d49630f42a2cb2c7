//! Observatory bring-up and tear-down
//!
//! Ekos and INDI connection, the startup and shutdown procedures, mount
//! parking while waiting for a job, and the startup/shutdown scripts. Every
//! check returns immediately; `false` means "not there yet, call again".

use crate::device::{methods, props, CommunicationStatus, ModuleKind, ParkStatus};
use crate::events::SchedulerEvent;
use crate::process::SchedulerProcess;
use crate::script::{RunningScript, ScriptEvent, ScriptPhase};
use crate::session::{
    EkosState, FailureCounters, IndiState, ParkWaitState, SchedulerState, ShutdownState, StartupState, TimerState,
};
use serde_json::Value;
use std::path::PathBuf;

impl SchedulerProcess {
    // =========================================================================
    // EKOS AND INDI
    // =========================================================================

    async fn communication_status(&self, property: &str) -> CommunicationStatus {
        match self.modules.read_as::<CommunicationStatus>(ModuleKind::Ekos, property).await {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!("Reading {} failed: {}", property, e);
                CommunicationStatus::Error
            }
        }
    }

    pub(crate) async fn check_ekos_state(&mut self) -> bool {
        if self.session.scheduler == SchedulerState::Paused {
            return false;
        }

        let status = self.communication_status(props::EKOS_STATUS).await;
        match self.session.ekos {
            EkosState::Idle => {
                if status == CommunicationStatus::Success {
                    self.session.ekos = EkosState::Ready;
                    return true;
                }
                tracing::info!("Ekos communication status is {:?}. Starting Ekos...", status);
                self.call_quietly(ModuleKind::Ekos, methods::START, &[]).await;
                self.session.ekos = EkosState::Starting;
                self.session.operation_timer.start(self.clock.as_ref());
                false
            }
            EkosState::Starting => match status {
                CommunicationStatus::Success => {
                    self.append_log("Ekos started.");
                    self.session.failures.ekos_connect = 0;
                    self.session.ekos = EkosState::Ready;
                    true
                }
                CommunicationStatus::Error => {
                    if FailureCounters::increase(&mut self.session.failures.ekos_connect) {
                        self.append_log("Starting Ekos failed. Retrying...");
                        self.call_quietly(ModuleKind::Ekos, methods::START, &[]).await;
                        return false;
                    }
                    self.append_log("Starting Ekos failed.");
                    self.stop_scheduler().await;
                    false
                }
                _ => {
                    let limit = self.settings.timeouts.ekos_start();
                    if !self.session.operation_timer.exceeded(self.clock.as_ref(), limit) {
                        return false;
                    }
                    if FailureCounters::increase(&mut self.session.failures.ekos_connect) {
                        self.append_log("Starting Ekos timed out. Retrying...");
                        self.call_quietly(ModuleKind::Ekos, methods::STOP, &[]).await;
                        self.call_quietly(ModuleKind::Ekos, methods::START, &[]).await;
                        self.session.operation_timer.start(self.clock.as_ref());
                        return false;
                    }
                    self.append_log("Starting Ekos timed out.");
                    self.stop_scheduler().await;
                    false
                }
            },
            EkosState::Stopping => {
                if status == CommunicationStatus::Idle {
                    self.append_log("Ekos stopped.");
                    self.session.ekos = EkosState::Idle;
                    return true;
                }
                false
            }
            EkosState::Ready => true,
        }
    }

    pub(crate) async fn check_indi_state(&mut self) -> bool {
        if self.session.scheduler == SchedulerState::Paused {
            return false;
        }

        match self.session.indi {
            IndiState::Idle => {
                if self.communication_status(props::INDI_STATUS).await == CommunicationStatus::Success {
                    tracing::debug!("Checking INDI properties...");
                    self.session.indi = IndiState::PropertyCheck;
                    self.session.failures.indi_connect = 0;
                } else {
                    tracing::debug!("Connecting INDI devices...");
                    self.call_quietly(ModuleKind::Ekos, methods::CONNECT_DEVICES, &[]).await;
                    self.session.indi = IndiState::Connecting;
                }
                self.session.operation_timer.start(self.clock.as_ref());
                false
            }
            IndiState::Connecting => {
                match self.communication_status(props::INDI_STATUS).await {
                    CommunicationStatus::Success => {
                        self.append_log("INDI devices connected.");
                        self.session.indi = IndiState::PropertyCheck;
                        self.session.operation_timer.start(self.clock.as_ref());
                    }
                    CommunicationStatus::Error => {
                        if FailureCounters::increase(&mut self.session.failures.indi_connect) {
                            self.append_log("One or more INDI devices failed to connect. Retrying...");
                            self.call_quietly(ModuleKind::Ekos, methods::CONNECT_DEVICES, &[]).await;
                        } else {
                            self.append_log(
                                "One or more INDI devices failed to connect. Check INDI control panel for details.",
                            );
                            self.stop_scheduler().await;
                        }
                    }
                    _ => {
                        let limit = self.settings.timeouts.indi_connect();
                        if self.session.operation_timer.exceeded(self.clock.as_ref(), limit) {
                            if FailureCounters::increase(&mut self.session.failures.indi_connect) {
                                self.append_log("One or more INDI devices timed out. Retrying...");
                                self.call_quietly(ModuleKind::Ekos, methods::CONNECT_DEVICES, &[]).await;
                                self.session.operation_timer.start(self.clock.as_ref());
                            } else {
                                self.append_log(
                                    "One or more INDI devices timed out. Check INDI control panel for details.",
                                );
                                self.stop_scheduler().await;
                            }
                        }
                    }
                }
                false
            }
            IndiState::Disconnecting => {
                if self.communication_status(props::INDI_STATUS).await == CommunicationStatus::Idle {
                    self.append_log("INDI devices disconnected.");
                    self.session.indi = IndiState::Idle;
                    return true;
                }
                false
            }
            IndiState::PropertyCheck => self.check_indi_properties().await,
            IndiState::Ready => true,
        }
    }

    /// Wait for the devices the startup procedure needs
    async fn check_indi_properties(&mut self) -> bool {
        tracing::debug!("Checking INDI properties.");
        let procedure = self.settings.procedure.clone();
        let required = [
            (procedure.unpark_dome, ModuleKind::Dome),
            (procedure.unpark_mount, ModuleKind::Mount),
            (procedure.uncap, ModuleKind::Cap),
        ];

        for (needed, kind) in required {
            if !needed || self.device_ready(kind) {
                continue;
            }
            if self.modules.read(kind, props::CAN_PARK).await.is_ok() {
                self.set_device_ready(kind, true);
                continue;
            }

            let limit = self.settings.timeouts.property_check();
            if self.session.operation_timer.exceeded(self.clock.as_ref(), limit) {
                self.session.operation_timer.start(self.clock.as_ref());
                self.append_log(format!(
                    "Warning: {} device not ready after timeout, attempting to recover...",
                    kind
                ));
                self.disconnect_indi().await;
                self.stop_ekos().await;
            }
            if kind == ModuleKind::Dome {
                self.append_log("Dome unpark required but dome is not yet ready.");
            } else {
                tracing::debug!("{} unpark required but {} is not yet ready.", kind, kind);
            }
            return false;
        }

        // Capture is required at all times
        if !self.modules.has(ModuleKind::Capture) {
            return false;
        }
        if !self.session.capture_ready {
            match self.modules.read(ModuleKind::Capture, props::COOLER_CONTROL).await {
                Ok(_) => self.session.capture_ready = true,
                Err(e) => tracing::warn!("Capture module is not ready yet: {}", e),
            }
        }

        self.session.indi = IndiState::Ready;
        self.session.failures.indi_connect = 0;
        true
    }

    fn device_ready(&self, kind: ModuleKind) -> bool {
        match kind {
            ModuleKind::Mount => self.session.mount_ready,
            ModuleKind::Dome => self.session.dome_ready,
            ModuleKind::Cap => self.session.cap_ready,
            ModuleKind::Capture => self.session.capture_ready,
            _ => self.modules.has(kind),
        }
    }

    /// Record that a device interface came up or went away
    pub fn set_device_ready(&mut self, kind: ModuleKind, ready: bool) {
        tracing::debug!("Device {} ready: {}", kind, ready);
        match kind {
            ModuleKind::Mount => self.session.mount_ready = ready,
            ModuleKind::Dome => self.session.dome_ready = ready,
            ModuleKind::Cap => self.session.cap_ready = ready,
            ModuleKind::Capture => self.session.capture_ready = ready,
            _ => {}
        }
    }

    pub(crate) async fn disconnect_indi(&mut self) {
        tracing::info!("Disconnecting INDI...");
        self.session.indi = IndiState::Disconnecting;
        self.call_quietly(ModuleKind::Ekos, methods::DISCONNECT_DEVICES, &[]).await;
    }

    pub(crate) async fn stop_ekos(&mut self) {
        tracing::info!("Stopping Ekos...");
        self.session.ekos = EkosState::Stopping;
        self.session.failures.ekos_connect = 0;
        self.call_quietly(ModuleKind::Ekos, methods::STOP, &[]).await;
        self.session.clear_device_ready();
    }

    /// Tear down Ekos and INDI after a failed device read so that they get
    /// reconnected. False when the read failure is not a connection loss.
    pub(crate) async fn manage_connection_loss(&mut self) -> bool {
        if self.session.scheduler != SchedulerState::Running {
            return false;
        }
        if matches!(self.session.ekos, EkosState::Idle | EkosState::Stopping) {
            return false;
        }
        if matches!(self.session.indi, IndiState::Idle | IndiState::Disconnecting) {
            return false;
        }

        if self.communication_status(props::EKOS_STATUS).await == CommunicationStatus::Success {
            tracing::debug!("Ekos is currently connected, checking INDI before mitigating connection loss.");
            if self.session.is_indi_connected() {
                tracing::debug!("INDI is currently connected, no connection loss mitigation needed.");
                return false;
            }
        }

        self.stop_current_job_action().await;
        self.disconnect_indi().await;
        self.stop_ekos().await;
        true
    }

    /// Shutdown has finished: disconnect and stop what is configured, then stop
    pub(crate) async fn complete_shutdown(&mut self) -> bool {
        if self.session.indi == IndiState::Disconnecting && !self.check_indi_state().await {
            return false;
        }
        if self.session.indi != IndiState::Idle && self.settings.stop_ekos_after_shutdown {
            self.disconnect_indi().await;
            return false;
        }
        if self.session.ekos == EkosState::Stopping && !self.check_ekos_state().await {
            return false;
        }
        if self.session.ekos != EkosState::Idle && self.settings.stop_ekos_after_shutdown {
            self.stop_ekos().await;
            return false;
        }

        if self.session.shutdown == ShutdownState::Complete {
            self.append_log("Shutdown complete.");
        } else {
            self.append_log("Shutdown procedure failed, aborting...");
        }
        self.stop_scheduler().await;
        true
    }

    // =========================================================================
    // STARTUP AND SHUTDOWN
    // =========================================================================

    pub(crate) async fn check_startup_state(&mut self) -> bool {
        if self.session.scheduler == SchedulerState::Paused {
            return false;
        }
        tracing::debug!("Checking startup state ({:?})...", self.session.startup);

        let needs_light = self.active_job().map_or(true, |j| j.light_frames_required);
        match self.session.startup {
            StartupState::Idle => {
                tracing::debug!("Startup idle. Starting startup process...");
                let script = self.settings.procedure.startup_script.clone();
                if self.communication_status(props::EKOS_STATUS).await == CommunicationStatus::Success {
                    if script.is_some() {
                        self.append_log("Ekos is already started, skipping startup script...");
                    }
                    self.session.startup = if needs_light {
                        StartupState::UnparkDome
                    } else {
                        StartupState::Complete
                    };
                    return true;
                }
                if let Some(path) = script {
                    self.session.startup = StartupState::Script;
                    self.execute_script(ScriptPhase::Startup, path);
                    return false;
                }
                self.session.startup = StartupState::UnparkDome;
                false
            }
            StartupState::Script => false,
            StartupState::UnparkDome => {
                if !needs_light {
                    self.session.startup = StartupState::Complete;
                    return true;
                }
                if self.settings.procedure.unpark_dome {
                    self.unpark_dome().await;
                } else {
                    self.session.startup = StartupState::UnparkMount;
                }
                false
            }
            StartupState::UnparkingDome => {
                self.check_dome_parking_status().await;
                false
            }
            StartupState::UnparkMount => {
                if self.settings.procedure.unpark_mount {
                    self.unpark_mount().await;
                } else {
                    self.session.startup = StartupState::UnparkCap;
                }
                false
            }
            StartupState::UnparkingMount => {
                self.check_mount_parking_status().await;
                false
            }
            StartupState::UnparkCap => {
                if self.settings.procedure.uncap {
                    self.unpark_cap().await;
                } else {
                    self.session.startup = StartupState::Complete;
                }
                false
            }
            StartupState::UnparkingCap => {
                self.check_cap_parking_status().await;
                false
            }
            StartupState::Complete => true,
            StartupState::Error => {
                self.stop_scheduler().await;
                true
            }
        }
    }

    pub(crate) async fn check_shutdown_state(&mut self) -> bool {
        tracing::debug!("Checking shutdown state ({:?})...", self.session.shutdown);
        if self.session.scheduler == SchedulerState::Paused {
            return false;
        }

        match self.session.shutdown {
            ShutdownState::Idle => {
                tracing::info!("Starting shutdown process...");
                self.active_job = None;
                if !self.session.manual_shutdown {
                    self.setup_next_iteration(TimerState::RunShutdown);
                    self.set_scheduler_state(SchedulerState::Shutdown);
                }
                self.events.emit(SchedulerEvent::ShutdownStarted);

                if self.settings.procedure.warm_ccd {
                    self.append_log("Warming up CCD...");
                    if self.modules.has(ModuleKind::Capture) {
                        tracing::debug!("Setting coolerControl=false");
                        self.call_quietly(ModuleKind::Capture, methods::SET_COOLER_CONTROL, &[Value::Bool(false)])
                            .await;
                    }
                }

                let procedure = &self.settings.procedure;
                if self.session.is_indi_connected() {
                    let next = if procedure.cap {
                        Some(ShutdownState::ParkCap)
                    } else if procedure.park_mount {
                        Some(ShutdownState::ParkMount)
                    } else if procedure.park_dome {
                        Some(ShutdownState::ParkDome)
                    } else {
                        None
                    };
                    if let Some(next) = next {
                        self.session.shutdown = next;
                        return false;
                    }
                } else {
                    self.append_log("Warning: Bypassing parking procedures, no INDI connection.");
                }

                if self.settings.procedure.shutdown_script.is_some() {
                    self.session.shutdown = ShutdownState::Script;
                    return false;
                }
                self.session.shutdown = ShutdownState::Complete;
                true
            }
            ShutdownState::ParkCap => {
                if !self.session.is_indi_connected() {
                    tracing::info!("Bypassing shutdown step 'park cap', no INDI connection.");
                    self.session.shutdown = ShutdownState::Script;
                } else if self.settings.procedure.cap {
                    self.park_cap().await;
                } else {
                    self.session.shutdown = ShutdownState::ParkMount;
                }
                false
            }
            ShutdownState::ParkingCap => {
                self.check_cap_parking_status().await;
                false
            }
            ShutdownState::ParkMount => {
                if !self.session.is_indi_connected() {
                    tracing::info!("Bypassing shutdown step 'park mount', no INDI connection.");
                    self.session.shutdown = ShutdownState::Script;
                } else if self.settings.procedure.park_mount {
                    self.park_mount().await;
                } else {
                    self.session.shutdown = ShutdownState::ParkDome;
                }
                false
            }
            ShutdownState::ParkingMount => {
                self.check_mount_parking_status().await;
                false
            }
            ShutdownState::ParkDome => {
                if !self.session.is_indi_connected() {
                    tracing::info!("Bypassing shutdown step 'park dome', no INDI connection.");
                    self.session.shutdown = ShutdownState::Script;
                } else if self.settings.procedure.park_dome {
                    self.park_dome().await;
                } else {
                    self.session.shutdown = ShutdownState::Script;
                }
                false
            }
            ShutdownState::ParkingDome => {
                self.check_dome_parking_status().await;
                false
            }
            ShutdownState::Script => {
                let Some(path) = self.settings.procedure.shutdown_script.clone() else {
                    self.session.shutdown = ShutdownState::Complete;
                    return false;
                };
                // The script may take INDI down with it, stop Ekos first
                if self.session.ekos == EkosState::Stopping && !self.check_ekos_state().await {
                    return false;
                }
                if self.session.ekos != EkosState::Idle && self.settings.shutdown_script_terminates_indi {
                    self.stop_ekos().await;
                    return false;
                }
                self.session.shutdown = ShutdownState::ScriptRunning;
                self.execute_script(ScriptPhase::Shutdown, path);
                false
            }
            ShutdownState::ScriptRunning => false,
            ShutdownState::Complete => self.complete_shutdown().await,
            ShutdownState::Error => {
                self.stop_scheduler().await;
                true
            }
        }
    }

    pub(crate) async fn check_park_wait_state(&mut self) -> bool {
        if self.session.scheduler == SchedulerState::Paused {
            return false;
        }
        match self.session.park_wait {
            ParkWaitState::Idle | ParkWaitState::Parked | ParkWaitState::Unparked => true,
            ParkWaitState::Park => {
                self.park_mount().await;
                false
            }
            ParkWaitState::Unpark => {
                self.unpark_mount().await;
                false
            }
            ParkWaitState::Parking | ParkWaitState::Unparking => {
                self.check_mount_parking_status().await;
                false
            }
            ParkWaitState::Error => {
                self.append_log("park/unpark wait procedure failed, aborting...");
                self.stop_scheduler().await;
                true
            }
        }
    }

    /// Run the startup procedure by hand, or abort it if it is in progress
    pub async fn run_startup_procedure(&mut self) {
        if matches!(
            self.session.startup,
            StartupState::Idle | StartupState::Error | StartupState::Complete
        ) {
            self.append_log("Warning: executing startup procedure manually...");
            self.session.startup = StartupState::Idle;
            self.session.manual_startup = true;
            self.check_startup_state().await;
            return;
        }

        match self.session.startup {
            StartupState::Script => self.terminate_script(),
            StartupState::UnparkingDome => {
                tracing::debug!("Aborting unparking dome...");
                self.call_quietly(ModuleKind::Dome, methods::ABORT, &[]).await;
            }
            StartupState::UnparkingMount => {
                tracing::debug!("Aborting unparking mount...");
                self.call_quietly(ModuleKind::Mount, methods::ABORT, &[]).await;
            }
            _ => {}
        }
        self.session.startup = StartupState::Idle;
        self.session.manual_startup = false;
        self.append_log("Startup procedure terminated.");
    }

    /// Run the shutdown procedure by hand, or abort it if it is in progress
    pub async fn run_shutdown_procedure(&mut self) {
        if matches!(
            self.session.shutdown,
            ShutdownState::Idle | ShutdownState::Error | ShutdownState::Complete
        ) {
            self.append_log("Warning: executing shutdown procedure manually...");
            self.session.shutdown = ShutdownState::Idle;
            self.session.manual_shutdown = true;
            self.check_shutdown_state().await;
            return;
        }

        match self.session.shutdown {
            ShutdownState::ScriptRunning => self.terminate_script(),
            ShutdownState::ParkingDome => {
                tracing::debug!("Aborting parking dome...");
                self.call_quietly(ModuleKind::Dome, methods::ABORT, &[]).await;
            }
            ShutdownState::ParkingMount => {
                tracing::debug!("Aborting parking mount...");
                self.call_quietly(ModuleKind::Mount, methods::ABORT, &[]).await;
            }
            _ => {}
        }
        self.session.shutdown = ShutdownState::Idle;
        self.session.manual_shutdown = false;
        self.append_log("Shutdown procedure terminated.");
    }

    /// Advance manually started procedures by one step
    pub(crate) async fn poll_manual_procedures(&mut self) {
        if self.session.manual_startup && self.check_startup_state().await {
            match self.session.startup {
                StartupState::Complete => self.append_log("Manual startup procedure completed successfully."),
                StartupState::Error => self.append_log("Manual startup procedure terminated due to errors."),
                _ => {}
            }
            self.session.manual_startup = false;
        }

        if self.session.manual_shutdown && self.check_shutdown_state().await {
            match self.session.shutdown {
                ShutdownState::Complete => {
                    self.append_log("Manual shutdown procedure completed successfully.");
                    if self.settings.stop_ekos_after_shutdown {
                        self.stop_ekos().await;
                    }
                }
                ShutdownState::Error => self.append_log("Manual shutdown procedure terminated due to errors."),
                _ => {}
            }
            self.session.shutdown = ShutdownState::Idle;
            self.session.manual_shutdown = false;
        }
    }

    // =========================================================================
    // PARKING
    // =========================================================================

    /// Park status of a device. None when the read failed and a reconnection
    /// is under way; a failed read without recovery reads as an error.
    async fn read_park_status(&mut self, kind: ModuleKind) -> Option<ParkStatus> {
        match self.modules.read_as::<ParkStatus>(kind, props::PARK_STATUS).await {
            Ok(status) => {
                tracing::debug!("{} parking status {:?}", kind, status);
                self.set_device_ready(kind, true);
                Some(status)
            }
            Err(e) => {
                tracing::error!("Warning: {} parkStatus request failed: {}", kind, e);
                if self.manage_connection_loss().await {
                    None
                } else {
                    Some(ParkStatus::Error)
                }
            }
        }
    }

    pub(crate) async fn park_cap(&mut self) {
        if !self.modules.has(ModuleKind::Cap) {
            self.append_log("Dust cover park requested but no dust covers detected.");
            self.session.shutdown = ShutdownState::Error;
            return;
        }
        let Some(status) = self.read_park_status(ModuleKind::Cap).await else {
            return;
        };
        if status != ParkStatus::Parked {
            self.session.shutdown = ShutdownState::ParkingCap;
            tracing::debug!("Parking dust cap...");
            self.call_quietly(ModuleKind::Cap, methods::PARK, &[]).await;
            self.append_log("Parking Cap...");
            self.session.operation_timer.start(self.clock.as_ref());
        } else {
            self.append_log("Cap already parked.");
            self.session.shutdown = ShutdownState::ParkMount;
        }
    }

    pub(crate) async fn unpark_cap(&mut self) {
        if !self.modules.has(ModuleKind::Cap) {
            self.append_log("Dust cover unpark requested but no dust covers detected.");
            self.session.startup = StartupState::Error;
            return;
        }
        let Some(status) = self.read_park_status(ModuleKind::Cap).await else {
            return;
        };
        if status != ParkStatus::Unparked {
            self.session.startup = StartupState::UnparkingCap;
            self.call_quietly(ModuleKind::Cap, methods::UNPARK, &[]).await;
            self.append_log("Unparking cap...");
            self.session.operation_timer.start(self.clock.as_ref());
        } else {
            self.append_log("Cap already unparked.");
            self.session.startup = StartupState::Complete;
        }
    }

    pub(crate) async fn check_cap_parking_status(&mut self) {
        if !self.modules.has(ModuleKind::Cap) {
            return;
        }
        let Some(status) = self.read_park_status(ModuleKind::Cap).await else {
            return;
        };

        match status {
            ParkStatus::Parked => {
                if self.session.shutdown == ShutdownState::ParkingCap {
                    self.append_log("Cap parked.");
                    self.session.shutdown = ShutdownState::ParkMount;
                }
                self.session.failures.parking_cap = 0;
            }
            ParkStatus::Unparked => {
                if self.session.startup == StartupState::UnparkingCap {
                    self.session.startup = StartupState::Complete;
                    self.append_log("Cap unparked.");
                }
                self.session.failures.parking_cap = 0;
            }
            ParkStatus::Parking | ParkStatus::Unparking => {
                let limit = self.settings.timeouts.cap_park();
                if !self.session.operation_timer.exceeded(self.clock.as_ref(), limit) {
                    return;
                }
                if FailureCounters::increase(&mut self.session.failures.parking_cap) {
                    let operation = if status == ParkStatus::Parking { "park" } else { "unpark" };
                    self.log_park_timeout("cap", operation, self.session.failures.parking_cap);
                    if status == ParkStatus::Parking {
                        self.park_cap().await;
                    } else {
                        self.unpark_cap().await;
                    }
                } else {
                    let operation = if status == ParkStatus::Parking { "park" } else { "unpark" };
                    self.log_last_park_timeout("cap", operation);
                    self.cap_parking_failed();
                }
            }
            ParkStatus::Error => self.cap_parking_failed(),
            ParkStatus::Unknown => {}
        }
    }

    fn log_park_timeout(&mut self, device: &str, operation: &str, attempt: u8) {
        self.append_log(format!(
            "Warning: {} {} operation timed out on attempt {}/{}. Restarting operation...",
            device,
            operation,
            attempt,
            crate::MAX_FAILURE_ATTEMPTS
        ));
    }

    fn log_last_park_timeout(&mut self, device: &str, operation: &str) {
        self.append_log(format!("Warning: {} {} operation timed out on last attempt.", device, operation));
    }

    fn cap_parking_failed(&mut self) {
        if self.session.shutdown == ShutdownState::ParkingCap {
            self.append_log("Cap parking error.");
            self.session.shutdown = ShutdownState::Error;
        } else if self.session.startup == StartupState::UnparkingCap {
            self.append_log("Cap unparking error.");
            self.session.startup = StartupState::Error;
        }
        self.session.failures.parking_cap = 0;
    }

    pub(crate) async fn park_mount(&mut self) {
        self.command_mount_park(false).await;
    }

    /// Request a mount park. A retry re-sends the command even while the mount
    /// still reports parking, restarting the operation timer.
    async fn command_mount_park(&mut self, retry: bool) {
        if !self.modules.has(ModuleKind::Mount) {
            self.append_log("Mount park requested but no mounts detected.");
            self.session.shutdown = ShutdownState::Error;
            return;
        }
        let Some(status) = self.read_park_status(ModuleKind::Mount).await else {
            return;
        };

        match status {
            ParkStatus::Parked => {
                if self.session.shutdown == ShutdownState::ParkMount {
                    self.session.shutdown = ShutdownState::ParkDome;
                }
                self.session.park_wait = ParkWaitState::Parked;
                self.append_log("Mount already parked.");
                return;
            }
            ParkStatus::Parking if !retry => {}
            _ => {
                tracing::debug!("Parking mount...");
                if let Err(e) = self.modules.call(ModuleKind::Mount, methods::PARK, &[]).await {
                    tracing::error!("Warning: mount park request failed: {}", e);
                    if !self.manage_connection_loss().await {
                        self.session.park_wait = ParkWaitState::Error;
                    }
                } else {
                    self.session.operation_timer.start(self.clock.as_ref());
                }
            }
        }

        if self.session.shutdown == ShutdownState::ParkMount {
            self.session.shutdown = ShutdownState::ParkingMount;
        }
        if self.session.park_wait != ParkWaitState::Error {
            self.session.park_wait = ParkWaitState::Parking;
        }
        self.append_log("Parking mount in progress...");
    }

    pub(crate) async fn unpark_mount(&mut self) {
        self.command_mount_unpark(false).await;
    }

    async fn command_mount_unpark(&mut self, retry: bool) {
        if !self.modules.has(ModuleKind::Mount) {
            self.append_log("Mount unpark requested but no mounts detected.");
            self.session.startup = StartupState::Error;
            return;
        }
        let Some(status) = self.read_park_status(ModuleKind::Mount).await else {
            return;
        };

        match status {
            ParkStatus::Unparked => {
                if self.session.startup == StartupState::UnparkMount {
                    self.session.startup = StartupState::UnparkCap;
                }
                self.session.park_wait = ParkWaitState::Unparked;
                self.append_log("Mount already unparked.");
                return;
            }
            ParkStatus::Unparking if !retry => {}
            _ => {
                if let Err(e) = self.modules.call(ModuleKind::Mount, methods::UNPARK, &[]).await {
                    tracing::error!("Warning: mount unpark request failed: {}", e);
                    if !self.manage_connection_loss().await {
                        self.session.park_wait = ParkWaitState::Error;
                    }
                } else {
                    self.session.operation_timer.start(self.clock.as_ref());
                }
            }
        }

        if self.session.startup == StartupState::UnparkMount {
            self.session.startup = StartupState::UnparkingMount;
        }
        if self.session.park_wait != ParkWaitState::Error {
            self.session.park_wait = ParkWaitState::Unparking;
        }
        tracing::info!("Unparking mount in progress...");
    }

    pub(crate) async fn check_mount_parking_status(&mut self) {
        if !self.modules.has(ModuleKind::Mount) {
            return;
        }
        let Some(status) = self.read_park_status(ModuleKind::Mount).await else {
            return;
        };

        match status {
            ParkStatus::Parked => {
                if self.session.shutdown == ShutdownState::ParkingMount {
                    self.session.shutdown = ShutdownState::ParkDome;
                }
                if self.session.park_wait == ParkWaitState::Parking {
                    self.session.park_wait = ParkWaitState::Parked;
                }
                self.append_log("Mount parked.");
                self.session.failures.parking_mount = 0;
            }
            ParkStatus::Unparked => {
                if self.session.startup == StartupState::UnparkingMount {
                    self.session.startup = StartupState::UnparkCap;
                }
                if self.session.park_wait == ParkWaitState::Unparking {
                    self.session.park_wait = ParkWaitState::Unparked;
                }
                self.append_log("Mount unparked.");
                self.session.failures.parking_mount = 0;
            }
            ParkStatus::Parking | ParkStatus::Unparking => {
                let parking = status == ParkStatus::Parking;
                let operation = if parking { "park" } else { "unpark" };
                let limit = self.settings.timeouts.mount_park();
                if !self.session.operation_timer.exceeded(self.clock.as_ref(), limit) {
                    tracing::info!("{} mount in progress...", if parking { "Parking" } else { "Unparking" });
                    return;
                }
                if FailureCounters::increase(&mut self.session.failures.parking_mount) {
                    self.log_park_timeout("mount", operation, self.session.failures.parking_mount);
                    if parking {
                        self.command_mount_park(true).await;
                    } else {
                        self.command_mount_unpark(true).await;
                    }
                } else {
                    self.log_last_park_timeout("mount", operation);
                    self.session.park_wait = ParkWaitState::Error;
                    if self.session.shutdown == ShutdownState::ParkingMount {
                        self.session.shutdown = ShutdownState::Error;
                    } else if self.session.startup == StartupState::UnparkingMount {
                        self.session.startup = StartupState::Error;
                    }
                }
            }
            ParkStatus::Error => {
                if self.session.startup == StartupState::UnparkingMount {
                    self.append_log("Mount unparking error.");
                    self.session.startup = StartupState::Error;
                    self.session.failures.parking_mount = 0;
                } else if self.session.shutdown == ShutdownState::ParkingMount {
                    if FailureCounters::increase(&mut self.session.failures.parking_mount) {
                        self.append_log(format!(
                            "Warning: mount park operation failed on attempt {}/{}. Restarting operation...",
                            self.session.failures.parking_mount,
                            crate::MAX_FAILURE_ATTEMPTS
                        ));
                        self.park_mount().await;
                    } else {
                        self.append_log("Mount parking error.");
                        self.session.shutdown = ShutdownState::Error;
                        self.session.failures.parking_mount = 0;
                    }
                } else if self.session.park_wait == ParkWaitState::Parking {
                    self.append_log("Mount parking error.");
                    self.session.park_wait = ParkWaitState::Error;
                    self.session.failures.parking_mount = 0;
                } else if self.session.park_wait == ParkWaitState::Unparking {
                    self.append_log("Mount unparking error.");
                    self.session.park_wait = ParkWaitState::Error;
                    self.session.failures.parking_mount = 0;
                }
            }
            ParkStatus::Unknown => {
                // The last request had no effect, move on
                if self.session.shutdown == ShutdownState::ParkingMount {
                    self.session.shutdown = ShutdownState::ParkDome;
                }
                if self.session.startup == StartupState::UnparkingMount {
                    self.session.startup = StartupState::UnparkCap;
                }
                if self.session.park_wait == ParkWaitState::Parking {
                    self.session.park_wait = ParkWaitState::Parked;
                } else if self.session.park_wait == ParkWaitState::Unparking {
                    self.session.park_wait = ParkWaitState::Unparked;
                }
                self.session.failures.parking_mount = 0;
            }
        }
    }

    /// Whether the mount is able to park and currently parked
    pub(crate) async fn is_mount_parked(&mut self) -> bool {
        if !self.modules.has(ModuleKind::Mount) {
            return false;
        }
        match self.modules.read_as::<bool>(ModuleKind::Mount, props::CAN_PARK).await {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                tracing::error!("Warning: mount canPark request failed: {}", e);
                self.manage_connection_loss().await;
                return false;
            }
        }
        match self.modules.read_as::<ParkStatus>(ModuleKind::Mount, props::PARK_STATUS).await {
            Ok(status) => status == ParkStatus::Parked,
            Err(e) => {
                tracing::error!("Warning: mount parking status property is invalid: {}", e);
                self.manage_connection_loss().await;
                false
            }
        }
    }

    pub(crate) async fn park_dome(&mut self) {
        if !self.modules.has(ModuleKind::Dome) {
            self.append_log("Dome park requested but no domes detected.");
            self.session.shutdown = ShutdownState::Error;
            return;
        }
        let Some(status) = self.read_park_status(ModuleKind::Dome).await else {
            return;
        };
        if status != ParkStatus::Parked {
            self.session.shutdown = ShutdownState::ParkingDome;
            self.call_quietly(ModuleKind::Dome, methods::PARK, &[]).await;
            self.append_log("Parking dome...");
            self.session.operation_timer.start(self.clock.as_ref());
        } else {
            self.append_log("Dome already parked.");
            self.session.shutdown = ShutdownState::Script;
        }
    }

    pub(crate) async fn unpark_dome(&mut self) {
        if !self.modules.has(ModuleKind::Dome) {
            self.append_log("Dome unpark requested but no domes detected.");
            self.session.startup = StartupState::Error;
            return;
        }
        let Some(status) = self.read_park_status(ModuleKind::Dome).await else {
            return;
        };
        if status != ParkStatus::Unparked {
            self.session.startup = StartupState::UnparkingDome;
            self.call_quietly(ModuleKind::Dome, methods::UNPARK, &[]).await;
            self.append_log("Unparking dome...");
            self.session.operation_timer.start(self.clock.as_ref());
        } else {
            self.append_log("Dome already unparked.");
            self.session.startup = StartupState::UnparkMount;
        }
    }

    pub(crate) async fn check_dome_parking_status(&mut self) {
        if !self.modules.has(ModuleKind::Dome) {
            return;
        }
        let Some(status) = self.read_park_status(ModuleKind::Dome).await else {
            return;
        };

        match status {
            ParkStatus::Parked => {
                if self.session.shutdown == ShutdownState::ParkingDome {
                    self.append_log("Dome parked.");
                    self.session.shutdown = ShutdownState::Script;
                }
                self.session.failures.parking_dome = 0;
            }
            ParkStatus::Unparked => {
                if self.session.startup == StartupState::UnparkingDome {
                    self.session.startup = StartupState::UnparkMount;
                    self.append_log("Dome unparked.");
                }
                self.session.failures.parking_dome = 0;
            }
            ParkStatus::Parking | ParkStatus::Unparking => {
                let limit = self.settings.timeouts.dome_park();
                if !self.session.operation_timer.exceeded(self.clock.as_ref(), limit) {
                    return;
                }
                if FailureCounters::increase(&mut self.session.failures.parking_dome) {
                    let operation = if status == ParkStatus::Parking { "park" } else { "unpark" };
                    self.log_park_timeout("dome", operation, self.session.failures.parking_dome);
                    if status == ParkStatus::Parking {
                        self.park_dome().await;
                    } else {
                        self.unpark_dome().await;
                    }
                } else {
                    let operation = if status == ParkStatus::Parking { "park" } else { "unpark" };
                    self.log_last_park_timeout("dome", operation);
                    self.dome_parking_failed();
                }
            }
            ParkStatus::Error => {
                let retry = FailureCounters::increase(&mut self.session.failures.parking_dome);
                if self.session.shutdown == ShutdownState::ParkingDome {
                    if retry {
                        self.append_log("Dome parking failed. Restarting operation...");
                        self.park_dome().await;
                    } else {
                        self.dome_parking_failed();
                    }
                } else if self.session.startup == StartupState::UnparkingDome {
                    if retry {
                        self.append_log("Dome unparking failed. Restarting operation...");
                        self.unpark_dome().await;
                    } else {
                        self.dome_parking_failed();
                    }
                }
            }
            ParkStatus::Unknown => {}
        }
    }

    fn dome_parking_failed(&mut self) {
        if self.session.shutdown == ShutdownState::ParkingDome {
            self.append_log("Dome parking error.");
            self.session.shutdown = ShutdownState::Error;
        } else if self.session.startup == StartupState::UnparkingDome {
            self.append_log("Dome unparking error.");
            self.session.startup = StartupState::Error;
        }
        self.session.failures.parking_dome = 0;
    }

    // =========================================================================
    // SCRIPTS
    // =========================================================================

    fn execute_script(&mut self, phase: ScriptPhase, path: PathBuf) {
        self.append_log(format!("Executing script {}...", path.display()));
        self.terminate_script();
        self.script = Some(RunningScript::spawn(phase, &path));
    }

    pub(crate) fn terminate_script(&mut self) {
        if let Some(script) = self.script.take() {
            script.terminate();
        }
    }

    /// Forward script output to the log and act on its exit
    pub(crate) fn poll_script(&mut self) {
        let Some(script) = self.script.as_mut() else {
            return;
        };
        let mut exit = None;
        let mut output = Vec::new();
        for event in script.drain() {
            match event {
                ScriptEvent::Output(line) => {
                    let line = line.split_whitespace().collect::<Vec<_>>().join(" ");
                    if !line.is_empty() {
                        output.push(line);
                    }
                }
                ScriptEvent::Exited(code) => exit = Some(code),
            }
        }
        for line in output {
            self.append_log(line);
        }
        if let Some(code) = exit {
            self.script = None;
            self.check_process_exit(code);
        }
    }

    fn check_process_exit(&mut self, code: i32) {
        if code == 0 {
            if self.session.startup == StartupState::Script {
                self.session.startup = StartupState::UnparkDome;
            } else if self.session.shutdown == ShutdownState::ScriptRunning {
                self.session.shutdown = ShutdownState::Complete;
            }
            return;
        }

        if self.session.startup == StartupState::Script {
            self.append_log("Startup script failed, aborting...");
            self.session.startup = StartupState::Error;
        } else if self.session.shutdown == ShutdownState::ScriptRunning {
            self.append_log("Shutdown script failed, aborting...");
            self.session.shutdown = ShutdownState::Error;
        }
    }
}
