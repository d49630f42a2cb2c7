//! Device module interface
//!
//! The scheduler drives the observatory through a small capability interface
//! per module kind: read a property, call a method. Commands return right
//! away; their effect shows up later in a status notification or on the next
//! property poll.

use crate::error::{DeviceError, DeviceResult};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Module kinds the scheduler talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModuleKind {
    /// Ekos manager: starts Ekos and connects INDI devices
    Ekos,
    Mount,
    Dome,
    Cap,
    Capture,
    Focus,
    Align,
    Guide,
    Weather,
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModuleKind::Ekos => "ekos",
            ModuleKind::Mount => "mount",
            ModuleKind::Dome => "dome",
            ModuleKind::Cap => "cap",
            ModuleKind::Capture => "capture",
            ModuleKind::Focus => "focus",
            ModuleKind::Align => "align",
            ModuleKind::Guide => "guide",
            ModuleKind::Weather => "weather",
        };
        f.write_str(s)
    }
}

/// Property names
pub mod props {
    pub const EKOS_STATUS: &str = "ekosStatus";
    pub const INDI_STATUS: &str = "indiStatus";
    pub const STATUS: &str = "status";
    pub const PARK_STATUS: &str = "parkStatus";
    pub const CAN_PARK: &str = "canPark";
    pub const IS_MOVING: &str = "isMoving";
    pub const COOLER_CONTROL: &str = "coolerControl";
    pub const CAN_AUTOFOCUS: &str = "canAutoFocus";
}

/// Method names
pub mod methods {
    pub const START: &str = "start";
    pub const STOP: &str = "stop";
    pub const ABORT: &str = "abort";
    pub const CONNECT_DEVICES: &str = "connectDevices";
    pub const DISCONNECT_DEVICES: &str = "disconnectDevices";
    pub const PARK: &str = "park";
    pub const UNPARK: &str = "unpark";
    pub const SLEW: &str = "slew";
    pub const RESET_MODEL: &str = "resetModel";
    pub const SET_COOLER_CONTROL: &str = "setCoolerControl";
    pub const LOAD_SEQUENCE_QUEUE: &str = "loadSequenceQueue";
    pub const SET_TARGET_NAME: &str = "setTargetName";
    pub const SET_CAPTURED_FRAMES_MAP: &str = "setCapturedFramesMap";
    pub const CLEAR_AUTOFOCUS_HFR: &str = "clearAutoFocusHFR";
    pub const RESET_FRAME: &str = "resetFrame";
    pub const SET_FILTER: &str = "setFilter";
    pub const SET_TARGET_COORDS: &str = "setTargetCoords";
    pub const SET_TARGET_ROTATION: &str = "setTargetRotation";
    pub const CAPTURE_AND_SOLVE: &str = "captureAndSolve";
    pub const LOAD_AND_SLEW: &str = "loadAndSlew";
    pub const CONNECT_GUIDER: &str = "connectGuider";
    pub const SET_AUTO_STAR: &str = "setAutoStarEnabled";
    pub const CLEAR_CALIBRATION: &str = "clearCalibration";
    pub const GUIDE: &str = "guide";
}

// =========================================================================
// STATUS VALUES
// =========================================================================

/// Ekos start and INDI connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommunicationStatus {
    Idle,
    Pending,
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParkStatus {
    Parked,
    Unparked,
    Parking,
    Unparking,
    Error,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MountStatus {
    Idle,
    Moving,
    Slewing,
    Tracking,
    Parking,
    Parked,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlignStatus {
    Idle,
    Progress,
    Syncing,
    Slewing,
    Complete,
    Failed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FocusStatus {
    Idle,
    Waiting,
    Progress,
    Framing,
    Complete,
    Failed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GuideStatus {
    Idle,
    Connected,
    Disconnected,
    Calibrating,
    CalibrationError,
    Guiding,
    Dithering,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaptureStatus {
    Idle,
    Capturing,
    Suspended,
    Complete,
    Aborted,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WeatherStatus {
    #[default]
    Idle,
    Ok,
    Warning,
    Alert,
}

/// Status change pushed by a module
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ModuleStatus {
    Mount(MountStatus),
    Align(AlignStatus),
    Focus(FocusStatus),
    Guide(GuideStatus),
    Capture(CaptureStatus),
    Weather(WeatherStatus),
}

// =========================================================================
// MODULE INTERFACE
// =========================================================================

/// One device module as seen by the scheduler
#[async_trait]
pub trait DeviceModule: Send + Sync {
    fn kind(&self) -> ModuleKind;

    /// Read a property; a transport failure means the value is unusable
    async fn read_property(&self, name: &str) -> DeviceResult<Value>;

    /// Fire a command; a refused command reports `DeviceError::Rejected`
    async fn call(&self, method: &str, args: &[Value]) -> DeviceResult<()>;
}

pub type SharedDeviceModule = Arc<dyn DeviceModule>;

/// The set of modules available to the scheduler
#[derive(Clone, Default)]
pub struct DeviceModules {
    modules: HashMap<ModuleKind, SharedDeviceModule>,
}

impl DeviceModules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, module: SharedDeviceModule) {
        tracing::debug!("Registered {} module", module.kind());
        self.modules.insert(module.kind(), module);
    }

    pub fn with(mut self, module: SharedDeviceModule) -> Self {
        self.register(module);
        self
    }

    pub fn remove(&mut self, kind: ModuleKind) -> Option<SharedDeviceModule> {
        self.modules.remove(&kind)
    }

    pub fn has(&self, kind: ModuleKind) -> bool {
        self.modules.contains_key(&kind)
    }

    pub fn get(&self, kind: ModuleKind) -> DeviceResult<&SharedDeviceModule> {
        self.modules
            .get(&kind)
            .ok_or_else(|| DeviceError::Unavailable(kind.to_string()))
    }

    pub async fn read(&self, kind: ModuleKind, property: &str) -> DeviceResult<Value> {
        self.get(kind)?.read_property(property).await
    }

    /// Read a property and decode it into a typed value
    pub async fn read_as<T: DeserializeOwned>(&self, kind: ModuleKind, property: &str) -> DeviceResult<T> {
        let value = self.read(kind, property).await?;
        serde_json::from_value(value.clone()).map_err(|_| DeviceError::InvalidValue {
            module: kind.to_string(),
            property: property.to_string(),
            value: value.to_string(),
        })
    }

    pub async fn call(&self, kind: ModuleKind, method: &str, args: &[Value]) -> DeviceResult<()> {
        tracing::debug!("{}.{}({:?})", kind, method, args);
        self.get(kind)?.call(method, args).await
    }
}

// =========================================================================
// SIMULATED MODULE
// =========================================================================

/// A value applied after the property has been read once more
#[derive(Debug, Clone)]
struct PendingValue {
    property: String,
    value: Value,
}

#[derive(Default)]
struct SimState {
    properties: HashMap<String, Value>,
    pending: Vec<PendingValue>,
    calls: Vec<(String, Vec<Value>)>,
    failures: HashMap<String, (DeviceError, u32)>,
    random_failure_rate: f64,
    sequence_path: Option<String>,
}

/// Logging stand-in for a real device module.
///
/// Commands move the module into an in-progress state which settles on the
/// next poll of the affected property, so the scheduler sees both phases.
pub struct SimulatedModule {
    kind: ModuleKind,
    state: Mutex<SimState>,
    capture_sink: Option<Arc<crate::sequence::MemorySequenceSource>>,
}

fn status_value<T: Serialize>(status: T) -> Value {
    serde_json::to_value(status).unwrap_or(Value::Null)
}

impl SimulatedModule {
    pub fn new(kind: ModuleKind) -> Self {
        let mut properties = HashMap::new();
        match kind {
            ModuleKind::Ekos => {
                properties.insert(props::EKOS_STATUS.to_string(), status_value(CommunicationStatus::Idle));
                properties.insert(props::INDI_STATUS.to_string(), status_value(CommunicationStatus::Idle));
            }
            ModuleKind::Mount => {
                properties.insert(props::STATUS.to_string(), status_value(MountStatus::Idle));
                properties.insert(props::PARK_STATUS.to_string(), status_value(ParkStatus::Unparked));
                properties.insert(props::CAN_PARK.to_string(), Value::Bool(true));
            }
            ModuleKind::Dome => {
                properties.insert(props::PARK_STATUS.to_string(), status_value(ParkStatus::Unparked));
                properties.insert(props::CAN_PARK.to_string(), Value::Bool(true));
                properties.insert(props::IS_MOVING.to_string(), Value::Bool(false));
            }
            ModuleKind::Cap => {
                properties.insert(props::PARK_STATUS.to_string(), status_value(ParkStatus::Unparked));
                properties.insert(props::CAN_PARK.to_string(), Value::Bool(true));
            }
            ModuleKind::Capture => {
                properties.insert(props::STATUS.to_string(), status_value(CaptureStatus::Idle));
                properties.insert(props::COOLER_CONTROL.to_string(), Value::Bool(true));
            }
            ModuleKind::Focus => {
                properties.insert(props::STATUS.to_string(), status_value(FocusStatus::Idle));
                properties.insert(props::CAN_AUTOFOCUS.to_string(), Value::Bool(true));
            }
            ModuleKind::Align => {
                properties.insert(props::STATUS.to_string(), status_value(AlignStatus::Idle));
            }
            ModuleKind::Guide => {
                properties.insert(props::STATUS.to_string(), status_value(GuideStatus::Idle));
            }
            ModuleKind::Weather => {
                properties.insert(props::STATUS.to_string(), status_value(WeatherStatus::Ok));
            }
        }
        Self {
            kind,
            state: Mutex::new(SimState {
                properties,
                ..SimState::default()
            }),
            capture_sink: None,
        }
    }

    /// Record completed captures into an in-memory sequence source
    pub fn with_capture_sink(mut self, sink: Arc<crate::sequence::MemorySequenceSource>) -> Self {
        self.capture_sink = Some(sink);
        self
    }

    /// Make every call fail with a communication error at the given rate
    pub fn with_random_failures(self, rate: f64) -> Self {
        if let Ok(mut s) = self.state.lock() {
            s.random_failure_rate = rate.clamp(0.0, 1.0);
        }
        self
    }

    pub fn set_property(&self, name: &str, value: Value) {
        if let Ok(mut s) = self.state.lock() {
            s.pending.retain(|p| p.property != name);
            s.properties.insert(name.to_string(), value);
        }
    }

    pub fn set_status<T: Serialize>(&self, status: T) {
        self.set_property(props::STATUS, status_value(status));
    }

    pub fn property(&self, name: &str) -> Option<Value> {
        self.state.lock().ok().and_then(|s| s.properties.get(name).cloned())
    }

    pub fn remove_property(&self, name: &str) {
        if let Ok(mut s) = self.state.lock() {
            s.properties.remove(name);
        }
    }

    /// Fail the next `times` calls of `method`
    pub fn fail_next(&self, method: &str, error: DeviceError, times: u32) {
        if let Ok(mut s) = self.state.lock() {
            s.failures.insert(method.to_string(), (error, times));
        }
    }

    pub fn calls(&self) -> Vec<(String, Vec<Value>)> {
        self.state.lock().map(|s| s.calls.clone()).unwrap_or_default()
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.state
            .lock()
            .map(|s| s.calls.iter().filter(|(m, _)| m == method).count())
            .unwrap_or(0)
    }

    pub fn clear_calls(&self) {
        if let Ok(mut s) = self.state.lock() {
            s.calls.clear();
        }
    }

    fn transition<T: Serialize>(s: &mut SimState, property: &str, now: T, then: T) {
        s.pending.retain(|p| p.property != property);
        s.properties.insert(property.to_string(), status_value(now));
        s.pending.push(PendingValue {
            property: property.to_string(),
            value: status_value(then),
        });
    }

    fn apply_call(&self, s: &mut SimState, method: &str, args: &[Value]) -> DeviceResult<()> {
        use methods::*;
        match (self.kind, method) {
            (ModuleKind::Ekos, START) => {
                Self::transition(s, props::EKOS_STATUS, CommunicationStatus::Pending, CommunicationStatus::Success)
            }
            (ModuleKind::Ekos, STOP) => {
                s.properties.insert(props::EKOS_STATUS.to_string(), status_value(CommunicationStatus::Idle));
                s.properties.insert(props::INDI_STATUS.to_string(), status_value(CommunicationStatus::Idle));
            }
            (ModuleKind::Ekos, CONNECT_DEVICES) => {
                Self::transition(s, props::INDI_STATUS, CommunicationStatus::Pending, CommunicationStatus::Success)
            }
            (ModuleKind::Ekos, DISCONNECT_DEVICES) => {
                s.properties.insert(props::INDI_STATUS.to_string(), status_value(CommunicationStatus::Idle));
            }

            (ModuleKind::Mount, SLEW) => Self::transition(s, props::STATUS, MountStatus::Slewing, MountStatus::Tracking),
            (ModuleKind::Mount, ABORT) => {
                s.properties.insert(props::STATUS.to_string(), status_value(MountStatus::Idle));
            }
            (ModuleKind::Mount, PARK) => {
                Self::transition(s, props::PARK_STATUS, ParkStatus::Parking, ParkStatus::Parked);
                s.properties.insert(props::STATUS.to_string(), status_value(MountStatus::Parked));
            }
            (ModuleKind::Mount, UNPARK) => {
                Self::transition(s, props::PARK_STATUS, ParkStatus::Unparking, ParkStatus::Unparked);
                s.properties.insert(props::STATUS.to_string(), status_value(MountStatus::Idle));
            }
            (ModuleKind::Mount, RESET_MODEL) => {}

            (ModuleKind::Dome | ModuleKind::Cap, PARK) => {
                Self::transition(s, props::PARK_STATUS, ParkStatus::Parking, ParkStatus::Parked)
            }
            (ModuleKind::Dome | ModuleKind::Cap, UNPARK) => {
                Self::transition(s, props::PARK_STATUS, ParkStatus::Unparking, ParkStatus::Unparked)
            }
            (ModuleKind::Dome, ABORT) => {}

            (ModuleKind::Capture, LOAD_SEQUENCE_QUEUE) => {
                s.sequence_path = args.first().and_then(|v| v.as_str()).map(str::to_string);
            }
            (ModuleKind::Capture, START) => {
                Self::transition(s, props::STATUS, CaptureStatus::Capturing, CaptureStatus::Complete);
                self.record_captures(s);
            }
            (ModuleKind::Capture, ABORT) => {
                s.properties.insert(props::STATUS.to_string(), status_value(CaptureStatus::Aborted));
            }
            (ModuleKind::Capture, SET_TARGET_NAME | SET_CAPTURED_FRAMES_MAP | CLEAR_AUTOFOCUS_HFR) => {}
            (ModuleKind::Capture, SET_COOLER_CONTROL) => {
                let on = args.first().and_then(Value::as_bool).unwrap_or(false);
                s.properties.insert(props::COOLER_CONTROL.to_string(), Value::Bool(on));
            }

            (ModuleKind::Focus, START) => Self::transition(s, props::STATUS, FocusStatus::Progress, FocusStatus::Complete),
            (ModuleKind::Focus, ABORT) => {
                s.properties.insert(props::STATUS.to_string(), status_value(FocusStatus::Aborted));
            }
            (ModuleKind::Focus, RESET_FRAME | SET_FILTER) => {}

            (ModuleKind::Align, CAPTURE_AND_SOLVE | LOAD_AND_SLEW) => {
                Self::transition(s, props::STATUS, AlignStatus::Progress, AlignStatus::Complete)
            }
            (ModuleKind::Align, ABORT) => {
                s.properties.insert(props::STATUS.to_string(), status_value(AlignStatus::Aborted));
            }
            (ModuleKind::Align, SET_TARGET_COORDS | SET_TARGET_ROTATION) => {}

            (ModuleKind::Guide, GUIDE) => Self::transition(s, props::STATUS, GuideStatus::Calibrating, GuideStatus::Guiding),
            (ModuleKind::Guide, ABORT) => {
                s.properties.insert(props::STATUS.to_string(), status_value(GuideStatus::Aborted));
            }
            (ModuleKind::Guide, CONNECT_GUIDER) => {
                s.properties.insert(props::STATUS.to_string(), status_value(GuideStatus::Connected));
            }
            (ModuleKind::Guide, SET_AUTO_STAR | CLEAR_CALIBRATION) => {}

            (kind, method) => {
                return Err(DeviceError::UnknownMethod {
                    module: kind.to_string(),
                    method: method.to_string(),
                })
            }
        }
        Ok(())
    }

    fn record_captures(&self, s: &SimState) {
        let (Some(sink), Some(path)) = (&self.capture_sink, &s.sequence_path) else {
            return;
        };
        use crate::sequence::SequenceSource;
        if let Ok(sequence) = sink.load_sequence(std::path::Path::new(path)) {
            for step in &sequence.steps {
                sink.add_captured(&step.signature, step.count);
            }
        }
    }
}

#[async_trait]
impl DeviceModule for SimulatedModule {
    fn kind(&self) -> ModuleKind {
        self.kind
    }

    async fn read_property(&self, name: &str) -> DeviceResult<Value> {
        let mut s = self.state.lock().map_err(|_| DeviceError::Communication {
            module: self.kind.to_string(),
            message: "state poisoned".to_string(),
        })?;
        let value = s.properties.get(name).cloned().ok_or_else(|| DeviceError::UnknownProperty {
            module: self.kind.to_string(),
            property: name.to_string(),
        })?;

        // Settle any in-progress transition for the next read
        if let Some(pos) = s.pending.iter().position(|p| p.property == name) {
            let pending = s.pending.remove(pos);
            s.properties.insert(pending.property, pending.value);
        }
        Ok(value)
    }

    async fn call(&self, method: &str, args: &[Value]) -> DeviceResult<()> {
        let mut s = self.state.lock().map_err(|_| DeviceError::Communication {
            module: self.kind.to_string(),
            message: "state poisoned".to_string(),
        })?;
        s.calls.push((method.to_string(), args.to_vec()));

        let scripted = match s.failures.get_mut(method) {
            Some((error, remaining)) => {
                *remaining = remaining.saturating_sub(1);
                Some((error.clone(), *remaining == 0))
            }
            None => None,
        };
        if let Some((error, exhausted)) = scripted {
            if exhausted {
                s.failures.remove(method);
            }
            tracing::info!("[SIM] {}.{} failing: {}", self.kind, method, error);
            return Err(error);
        }

        if s.random_failure_rate > 0.0 {
            use rand::Rng;
            if rand::thread_rng().gen_bool(s.random_failure_rate) {
                return Err(DeviceError::Communication {
                    module: self.kind.to_string(),
                    message: "simulated transport failure".to_string(),
                });
            }
        }

        tracing::info!("[SIM] {}.{}({:?})", self.kind, method, args);
        self.apply_call(&mut s, method, args)
    }
}

/// A complete simulated observatory, with handles on every module
pub struct SimulatedObservatory {
    pub ekos: Arc<SimulatedModule>,
    pub mount: Arc<SimulatedModule>,
    pub dome: Arc<SimulatedModule>,
    pub cap: Arc<SimulatedModule>,
    pub capture: Arc<SimulatedModule>,
    pub focus: Arc<SimulatedModule>,
    pub align: Arc<SimulatedModule>,
    pub guide: Arc<SimulatedModule>,
    pub weather: Arc<SimulatedModule>,
}

impl SimulatedObservatory {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Captures completed by the simulated capture module are added to `sink`
    pub fn with_capture_sink(sink: Arc<crate::sequence::MemorySequenceSource>) -> Self {
        Self::build(Some(sink))
    }

    fn build(sink: Option<Arc<crate::sequence::MemorySequenceSource>>) -> Self {
        let mut capture = SimulatedModule::new(ModuleKind::Capture);
        if let Some(sink) = sink {
            capture = capture.with_capture_sink(sink);
        }
        Self {
            ekos: Arc::new(SimulatedModule::new(ModuleKind::Ekos)),
            mount: Arc::new(SimulatedModule::new(ModuleKind::Mount)),
            dome: Arc::new(SimulatedModule::new(ModuleKind::Dome)),
            cap: Arc::new(SimulatedModule::new(ModuleKind::Cap)),
            capture: Arc::new(capture),
            focus: Arc::new(SimulatedModule::new(ModuleKind::Focus)),
            align: Arc::new(SimulatedModule::new(ModuleKind::Align)),
            guide: Arc::new(SimulatedModule::new(ModuleKind::Guide)),
            weather: Arc::new(SimulatedModule::new(ModuleKind::Weather)),
        }
    }

    pub fn modules(&self) -> DeviceModules {
        DeviceModules::new()
            .with(self.ekos.clone())
            .with(self.mount.clone())
            .with(self.dome.clone())
            .with(self.cap.clone())
            .with(self.capture.clone())
            .with(self.focus.clone())
            .with(self.align.clone())
            .with(self.guide.clone())
            .with(self.weather.clone())
    }
}

impl Default for SimulatedObservatory {
    fn default() -> Self {
        Self::new()
    }
}
