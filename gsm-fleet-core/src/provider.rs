use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;

use crate::call::CallController;
use crate::models::call::{is_valid_phone_number, CallId, CallRecord, CallSummary};
use crate::models::config::{FleetConfig, ProviderKind};
use crate::models::error::{CallError, InitError, SmsError};
use crate::models::module::{ModuleId, ModuleStatus, ModuleSummary};
use crate::models::state::{CallStatus, TerminationReason};
use crate::registry::{HealthMonitor, ModuleRegistry};
use crate::simulator::{SimulatedAudio, SimulatedPorts};
use crate::sms::SmsDispatcher;
use crate::storage::cipher::Aes256GcmEncryptor;
use crate::traits::audio_input::AudioBackend;
use crate::traits::call_observer::CallObserver;
use crate::traits::encryptor::RecordingEncryptor;
use crate::traits::port::PortOpener;
use crate::traits::provider::{CallProvider, SmsProvider, SmsReceipt};

/// Serial and audio backends a fleet is built on.
#[derive(Clone)]
pub struct Hardware {
    pub opener: Arc<dyn PortOpener>,
    pub audio: Option<Arc<dyn AudioBackend>>,
}

impl Hardware {
    /// In-process SIM800C simulator with tone-generating audio inputs.
    pub fn simulated() -> (Self, SimulatedPorts) {
        let ports = SimulatedPorts::new();
        let hardware = Self {
            opener: Arc::new(ports.clone()),
            audio: Some(Arc::new(SimulatedAudio::new())),
        };
        (hardware, ports)
    }
}

/// The SIM800C fleet: registry, health monitor, call controller and SMS
/// dispatcher sharing one set of modules.
pub struct Fleet {
    registry: ModuleRegistry,
    health: HealthMonitor,
    calls: CallController,
    sms: SmsDispatcher,
}

impl Fleet {
    /// Register every configured module and start health monitoring.
    ///
    /// Modules whose port cannot be opened are registered in `Error` and
    /// retried in the background; only configuration problems fail here.
    pub fn start(config: &FleetConfig, hardware: Hardware) -> Result<Self, InitError> {
        config.validate().map_err(InitError::InvalidConfig)?;

        let encryptor: Option<Box<dyn RecordingEncryptor>> = match config.recording.encryption_key {
            Some(ref key) => Some(Box::new(
                Aes256GcmEncryptor::from_hex(key).map_err(InitError::InvalidConfig)?,
            )),
            None => None,
        };

        let registry = ModuleRegistry::new(hardware.opener, hardware.audio, config.channel.clone());
        let ids = registry.init(&config.modules)?;

        let health = HealthMonitor::new(registry.clone(), config.health.clone(), config.channel.clone());

        let calls = CallController::new(
            registry.clone(),
            config.calls.clone(),
            config.recording.clone(),
            config.channel.command_timeout(),
            encryptor,
        );
        let sms = SmsDispatcher::new(registry.clone(), config.sms.clone());

        let inbox = sms.clone();
        health.set_message_handler(Arc::new(move |module: &ModuleId, index: u32| {
            if let Err(e) = inbox.receive_sms(module, index) {
                log::warn!("{}: failed to read message {}: {}", module, index, e);
            }
        }));
        health.start();

        log::info!("fleet started with {} modules", ids.len());
        Ok(Self {
            registry,
            health,
            calls,
            sms,
        })
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn calls(&self) -> &CallController {
        &self.calls
    }

    pub fn sms(&self) -> &SmsDispatcher {
        &self.sms
    }

    pub fn set_call_observer(&self, observer: Arc<dyn CallObserver>) {
        self.calls.set_observer(observer);
    }

    /// Hang up calls, stop polling and close every channel.
    pub fn shutdown(&self) {
        self.calls.shutdown();
        self.health.shutdown();
        self.registry.shutdown();
        log::info!("fleet stopped");
    }
}

impl SmsProvider for Fleet {
    fn send_sms(&self, module: &ModuleId, phone: &str, text: &str) -> Result<SmsReceipt, SmsError> {
        SmsProvider::send_sms(&self.sms, module, phone, text)
    }

    fn send_via_best(&self, phone: &str, text: &str, min_signal: u8) -> Result<SmsReceipt, SmsError> {
        self.sms.send_via_best(phone, text, min_signal)
    }
}

impl CallProvider for Fleet {
    fn make_call(&self, module: &ModuleId, phone: &str) -> Result<CallSummary, CallError> {
        let call_id = self.calls.make_call(module, phone)?;
        self.calls
            .get_call(&call_id)
            .ok_or_else(|| CallError::UnknownCall(call_id.to_string()))
    }

    fn answer_call(&self, module: &ModuleId) -> Result<CallSummary, CallError> {
        let call_id = self.calls.answer_call(module)?;
        self.calls
            .get_call(&call_id)
            .ok_or_else(|| CallError::UnknownCall(call_id.to_string()))
    }

    fn hang_up(&self, call_id: &CallId) -> Result<(), CallError> {
        self.calls.hang_up(call_id)
    }

    fn active_calls(&self) -> Vec<CallSummary> {
        self.calls.get_active_calls()
    }

    fn modules(&self) -> Vec<ModuleSummary> {
        self.registry.list()
    }
}

const DEV_MODULE: &str = "dev";

/// No hardware: every operation succeeds, is logged and gets a synthetic id.
/// Calls connect immediately and move to history on hangup.
#[derive(Default)]
pub struct DevelopmentProvider {
    calls: Mutex<HashMap<CallId, CallRecord>>,
    history: Mutex<Vec<CallRecord>>,
}

impl DevelopmentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call_history(&self) -> Vec<CallSummary> {
        self.history.lock().iter().map(CallRecord::summary).collect()
    }
}

impl SmsProvider for DevelopmentProvider {
    fn send_sms(&self, module: &ModuleId, phone: &str, text: &str) -> Result<SmsReceipt, SmsError> {
        if !is_valid_phone_number(phone.trim()) {
            return Err(SmsError::InvalidNumber(phone.to_string()));
        }
        let message_id = format!("dev_{}", rand::rng().random_range(100_000..1_000_000u32));
        log::info!("development SMS to {} via {}: {:?} ({})", phone, module, text, message_id);
        Ok(SmsReceipt {
            module_id: module.clone(),
            message_id,
        })
    }

    fn send_via_best(&self, phone: &str, text: &str, _min_signal: u8) -> Result<SmsReceipt, SmsError> {
        self.send_sms(&ModuleId::from(DEV_MODULE), phone, text)
    }
}

impl CallProvider for DevelopmentProvider {
    fn make_call(&self, module: &ModuleId, phone: &str) -> Result<CallSummary, CallError> {
        if !is_valid_phone_number(phone.trim()) {
            return Err(CallError::InvalidNumber(phone.to_string()));
        }
        let mut record = CallRecord::new(module.clone(), phone.trim());
        record.transition(CallStatus::Ringing);
        record.transition(CallStatus::Active);
        log::info!("development call {} to {} via {}", record.id, phone, module);
        let summary = record.summary();
        self.calls.lock().insert(record.id.clone(), record);
        Ok(summary)
    }

    fn answer_call(&self, module: &ModuleId) -> Result<CallSummary, CallError> {
        Err(CallError::NoIncomingCall(module.to_string()))
    }

    fn hang_up(&self, call_id: &CallId) -> Result<(), CallError> {
        let mut record = self
            .calls
            .lock()
            .remove(call_id)
            .ok_or_else(|| CallError::UnknownCall(call_id.to_string()))?;
        record.transition(CallStatus::Ended);
        record.termination = Some(TerminationReason::LocalHangup);
        log::info!("development call {} ended", call_id);
        self.history.lock().push(record);
        Ok(())
    }

    fn active_calls(&self) -> Vec<CallSummary> {
        let mut calls: Vec<CallSummary> = self.calls.lock().values().map(CallRecord::summary).collect();
        calls.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        calls
    }

    fn modules(&self) -> Vec<ModuleSummary> {
        vec![ModuleSummary {
            id: ModuleId::from(DEV_MODULE),
            status: ModuleStatus::Connected,
            signal_strength: 100,
            battery_level: None,
            network_operator: "development".into(),
            port: String::new(),
            audio_device: false,
        }]
    }
}

/// Backend chosen once from configuration.
pub enum Provider {
    Sim800c(Arc<Fleet>),
    Development(Arc<DevelopmentProvider>),
}

impl Provider {
    pub fn from_config(config: &FleetConfig, hardware: Hardware) -> Result<Self, InitError> {
        match config.provider {
            ProviderKind::Sim800c => Ok(Self::Sim800c(Arc::new(Fleet::start(config, hardware)?))),
            ProviderKind::Development => {
                log::warn!("development provider selected, no hardware will be used");
                Ok(Self::Development(Arc::new(DevelopmentProvider::new())))
            }
        }
    }

    pub fn kind(&self) -> ProviderKind {
        match self {
            Self::Sim800c(_) => ProviderKind::Sim800c,
            Self::Development(_) => ProviderKind::Development,
        }
    }

    pub fn fleet(&self) -> Option<&Arc<Fleet>> {
        match self {
            Self::Sim800c(fleet) => Some(fleet),
            Self::Development(_) => None,
        }
    }

    pub fn sms(&self) -> Arc<dyn SmsProvider> {
        match self {
            Self::Sim800c(fleet) => Arc::clone(fleet) as Arc<dyn SmsProvider>,
            Self::Development(dev) => Arc::clone(dev) as Arc<dyn SmsProvider>,
        }
    }

    pub fn calls(&self) -> Arc<dyn CallProvider> {
        match self {
            Self::Sim800c(fleet) => Arc::clone(fleet) as Arc<dyn CallProvider>,
            Self::Development(dev) => Arc::clone(dev) as Arc<dyn CallProvider>,
        }
    }

    pub fn shutdown(&self) {
        if let Self::Sim800c(fleet) = self {
            fleet.shutdown();
        }
    }
}
