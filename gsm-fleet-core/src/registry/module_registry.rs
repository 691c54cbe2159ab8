use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};

use crate::channel::{AtChannel, ChannelFault};
use crate::models::config::ChannelSettings;
use crate::models::error::{CallError, InitError};
use crate::models::module::{Module, ModuleConfig, ModuleId, ModuleStatus, ModuleSummary, Telemetry};
use crate::traits::audio_input::{AudioBackend, AudioInput};
use crate::traits::port::PortOpener;

/// Constraints for [`ModuleRegistry::select_module`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionCriteria {
    /// Minimum signal strength in percent.
    pub min_signal: u8,
    pub exclude: Vec<ModuleId>,
}

impl SelectionCriteria {
    pub fn min_signal(min_signal: u8) -> Self {
        Self {
            min_signal,
            exclude: Vec::new(),
        }
    }
}

struct ModuleEntry {
    record: Module,
    channel: Arc<AtChannel>,
    audio: Option<Arc<dyn AudioInput>>,
    missed_polls: u32,
    last_ring: Option<Instant>,
}

struct RegistryInner {
    modules: RwLock<HashMap<ModuleId, ModuleEntry>>,
    opener: Arc<dyn PortOpener>,
    audio_backend: Option<Arc<dyn AudioBackend>>,
    settings: ChannelSettings,
    running: AtomicBool,
    reconnecting: Mutex<HashSet<ModuleId>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
}

/// Owns every module record and its AT channel.
///
/// All status and telemetry mutation goes through these methods; the map
/// lock is never held across serial I/O. Cloning shares the same registry.
#[derive(Clone)]
pub struct ModuleRegistry {
    inner: Arc<RegistryInner>,
}

impl ModuleRegistry {
    pub fn new(
        opener: Arc<dyn PortOpener>,
        audio_backend: Option<Arc<dyn AudioBackend>>,
        settings: ChannelSettings,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = bounded(0);
        Self {
            inner: Arc::new(RegistryInner {
                modules: RwLock::new(HashMap::new()),
                opener,
                audio_backend,
                settings,
                running: AtomicBool::new(true),
                reconnecting: Mutex::new(HashSet::new()),
                workers: Mutex::new(Vec::new()),
                shutdown_tx: Mutex::new(Some(shutdown_tx)),
                shutdown_rx,
            }),
        }
    }

    /// Register every configured module. Stops at the first invalid or
    /// duplicate entry.
    pub fn init(&self, configs: &[ModuleConfig]) -> Result<Vec<ModuleId>, InitError> {
        configs.iter().map(|config| self.add_module(config)).collect()
    }

    /// Register a module and open its channel.
    ///
    /// A serial failure does not reject the module: it is kept with status
    /// `Error` and reconnected in the background.
    pub fn add_module(&self, config: &ModuleConfig) -> Result<ModuleId, InitError> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(InitError::ShutDown);
        }
        config.validate().map_err(InitError::InvalidConfig)?;

        let record = Module::from_config(config);
        let id = record.id.clone();
        let channel = Arc::new(AtChannel::new(
            id.clone(),
            &config.port,
            config.baud_rate,
            Arc::clone(&self.inner.opener),
            self.inner.settings.clone(),
        ));
        let weak = Arc::downgrade(&self.inner);
        channel.set_fault_handler(Arc::new(move |module: &ModuleId, fault: ChannelFault| {
            if let Some(inner) = weak.upgrade() {
                RegistryInner::on_fault(&inner, module, fault);
            }
        }));
        let audio = self.bind_audio(config);

        {
            let mut modules = self.inner.modules.write();
            if modules.contains_key(&id) {
                return Err(InitError::DuplicateModule(id.to_string()));
            }
            modules.insert(
                id.clone(),
                ModuleEntry {
                    record,
                    channel: Arc::clone(&channel),
                    audio,
                    missed_polls: 0,
                    last_ring: None,
                },
            );
        }

        match channel.connect() {
            Ok(()) => {
                self.set_status(&id, ModuleStatus::Connected);
                log::info!("{}: registered on {}", id, config.port);
            }
            Err(e) => {
                log::warn!("{}: failed to open {}: {}", id, config.port, e);
                self.set_status(&id, ModuleStatus::Error);
                self.schedule_reconnect(&id);
            }
        }
        Ok(id)
    }

    fn bind_audio(&self, config: &ModuleConfig) -> Option<Arc<dyn AudioInput>> {
        let device = config.audio_device.as_deref()?;
        let Some(backend) = self.inner.audio_backend.as_ref() else {
            log::warn!("{}: audio device {} configured but no audio backend", config.id, device);
            return None;
        };
        match backend.bind(device) {
            Ok(input) => Some(input),
            Err(e) => {
                log::warn!("{}: audio device {} unavailable: {}", config.id, device, e);
                None
            }
        }
    }

    /// Highest-signal `Connected` module matching `criteria`; ties go to the
    /// lowest id.
    pub fn select_module(&self, criteria: &SelectionCriteria) -> Option<ModuleId> {
        self.inner
            .modules
            .read()
            .values()
            .map(|entry| &entry.record)
            .filter(|m| m.status.is_idle())
            .filter(|m| m.signal_strength >= criteria.min_signal)
            .filter(|m| !criteria.exclude.contains(&m.id))
            .max_by(|a, b| {
                a.signal_strength
                    .cmp(&b.signal_strength)
                    .then_with(|| b.id.cmp(&a.id))
            })
            .map(|m| m.id.clone())
    }

    /// Connected modules with at least `min_signal`, best first.
    pub fn ranked_modules(&self, min_signal: u8) -> Vec<ModuleId> {
        let mut candidates: Vec<(u8, ModuleId)> = self
            .inner
            .modules
            .read()
            .values()
            .filter(|e| e.record.status.is_idle() && e.record.signal_strength >= min_signal)
            .map(|e| (e.record.signal_strength, e.record.id.clone()))
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        candidates.into_iter().map(|(_, id)| id).collect()
    }

    pub fn get_status(&self, id: &ModuleId) -> Option<Module> {
        self.inner.modules.read().get(id).map(|e| e.record.clone())
    }

    pub fn status(&self, id: &ModuleId) -> Option<ModuleStatus> {
        self.inner.modules.read().get(id).map(|e| e.record.status)
    }

    /// Summaries of every module, ordered by id.
    pub fn list(&self) -> Vec<ModuleSummary> {
        let mut summaries: Vec<ModuleSummary> = self
            .inner
            .modules
            .read()
            .values()
            .map(|e| e.record.summary())
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    pub fn module_ids(&self) -> Vec<ModuleId> {
        let mut ids: Vec<ModuleId> = self.inner.modules.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn channel(&self, id: &ModuleId) -> Option<Arc<AtChannel>> {
        self.inner.modules.read().get(id).map(|e| Arc::clone(&e.channel))
    }

    pub fn audio_input(&self, id: &ModuleId) -> Option<Arc<dyn AudioInput>> {
        self.inner.modules.read().get(id).and_then(|e| e.audio.clone())
    }

    /// Atomically move an idle module to `Calling` and hand out its channel.
    pub fn claim_for_call(&self, id: &ModuleId) -> Result<Arc<AtChannel>, CallError> {
        let mut modules = self.inner.modules.write();
        let entry = modules
            .get_mut(id)
            .ok_or_else(|| CallError::UnknownModule(id.to_string()))?;
        match entry.record.status {
            ModuleStatus::Connected => {
                entry.record.status = ModuleStatus::Calling;
                Ok(Arc::clone(&entry.channel))
            }
            ModuleStatus::Calling | ModuleStatus::Receiving => {
                Err(CallError::ModuleBusy(id.to_string()))
            }
            ModuleStatus::Disconnected | ModuleStatus::Error => {
                Err(CallError::ModuleUnavailable(id.to_string()))
            }
        }
    }

    /// Return a module to `Connected` after its call ended.
    ///
    /// A module that faulted meanwhile keeps its `Error` status.
    pub fn release(&self, id: &ModuleId) {
        if let Some(entry) = self.inner.modules.write().get_mut(id) {
            if entry.record.status == ModuleStatus::Calling {
                entry.record.status = ModuleStatus::Connected;
            }
        }
    }

    /// Mark an idle module as ringing with an incoming call.
    pub fn mark_receiving(&self, id: &ModuleId, caller: Option<String>) {
        if let Some(entry) = self.inner.modules.write().get_mut(id) {
            match entry.record.status {
                ModuleStatus::Connected => {
                    log::info!(
                        "{}: incoming call from {}",
                        id,
                        caller.as_deref().unwrap_or("unknown")
                    );
                    entry.record.status = ModuleStatus::Receiving;
                    entry.record.incoming_caller = caller;
                    entry.last_ring = Some(Instant::now());
                }
                ModuleStatus::Receiving => {
                    if caller.is_some() {
                        entry.record.incoming_caller = caller;
                    }
                    entry.last_ring = Some(Instant::now());
                }
                _ => {}
            }
        }
    }

    pub fn clear_receiving(&self, id: &ModuleId) {
        if let Some(entry) = self.inner.modules.write().get_mut(id) {
            if entry.record.status == ModuleStatus::Receiving {
                log::info!("{}: incoming call ended", id);
                entry.record.status = ModuleStatus::Connected;
                entry.record.incoming_caller = None;
                entry.last_ring = None;
            }
        }
    }

    /// Return a `Receiving` module to `Connected` when it has not rung for
    /// `silence`. Returns whether it did.
    pub fn expire_receiving(&self, id: &ModuleId, silence: Duration) -> bool {
        let mut modules = self.inner.modules.write();
        let Some(entry) = modules.get_mut(id) else {
            return false;
        };
        let stale = entry.record.status == ModuleStatus::Receiving
            && entry.last_ring.map_or(true, |at| at.elapsed() >= silence);
        if stale {
            log::info!("{}: caller gave up, no RING for {:?}", id, silence);
            entry.record.status = ModuleStatus::Connected;
            entry.record.incoming_caller = None;
            entry.last_ring = None;
        }
        stale
    }

    /// Atomically move a `Receiving` module to `Calling` to answer its call.
    ///
    /// Returns the channel and the caller id, if one was reported.
    pub fn claim_incoming(&self, id: &ModuleId) -> Result<(Arc<AtChannel>, Option<String>), CallError> {
        let mut modules = self.inner.modules.write();
        let entry = modules
            .get_mut(id)
            .ok_or_else(|| CallError::UnknownModule(id.to_string()))?;
        match entry.record.status {
            ModuleStatus::Receiving => {
                entry.record.status = ModuleStatus::Calling;
                entry.last_ring = None;
                let caller = entry.record.incoming_caller.take();
                Ok((Arc::clone(&entry.channel), caller))
            }
            ModuleStatus::Connected => Err(CallError::NoIncomingCall(id.to_string())),
            ModuleStatus::Calling => Err(CallError::ModuleBusy(id.to_string())),
            ModuleStatus::Disconnected | ModuleStatus::Error => {
                Err(CallError::ModuleUnavailable(id.to_string()))
            }
        }
    }

    pub fn update_telemetry(&self, id: &ModuleId, telemetry: &Telemetry) {
        if let Some(entry) = self.inner.modules.write().get_mut(id) {
            entry.record.apply_telemetry(telemetry);
            entry.missed_polls = 0;
        }
    }

    /// Count a failed health poll and return the consecutive total.
    pub fn record_poll_miss(&self, id: &ModuleId) -> u32 {
        match self.inner.modules.write().get_mut(id) {
            Some(entry) => {
                entry.missed_polls += 1;
                entry.missed_polls
            }
            None => 0,
        }
    }

    /// Mark a module `Error` and reconnect it in the background.
    pub fn mark_failed(&self, id: &ModuleId) {
        self.set_status(id, ModuleStatus::Error);
        self.schedule_reconnect(id);
    }

    /// Start a reconnect worker for `id` unless one is already running.
    pub fn schedule_reconnect(&self, id: &ModuleId) {
        RegistryInner::schedule_reconnect(&self.inner, id);
    }

    pub fn is_reconnecting(&self, id: &ModuleId) -> bool {
        self.inner.reconnecting.lock().contains(id)
    }

    /// Stop reconnect workers and close every channel.
    pub fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown_tx.lock().take();
        let workers: Vec<_> = self.inner.workers.lock().drain(..).collect();
        for handle in workers {
            let _ = handle.join();
        }

        let channels: Vec<(ModuleId, Arc<AtChannel>)> = self
            .inner
            .modules
            .read()
            .iter()
            .map(|(id, e)| (id.clone(), Arc::clone(&e.channel)))
            .collect();
        for (id, channel) in channels {
            channel.close();
            self.set_status(&id, ModuleStatus::Disconnected);
        }
        log::info!("module registry shut down");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn set_status(&self, id: &ModuleId, status: ModuleStatus) {
        self.inner.set_status(id, status);
    }
}

impl RegistryInner {
    fn set_status(&self, id: &ModuleId, status: ModuleStatus) {
        if let Some(entry) = self.modules.write().get_mut(id) {
            if entry.record.status != status {
                log::debug!("{}: {:?} -> {:?}", id, entry.record.status, status);
                entry.record.status = status;
            }
            if status != ModuleStatus::Receiving {
                entry.record.incoming_caller = None;
            }
        }
    }

    fn on_fault(inner: &Arc<Self>, id: &ModuleId, fault: ChannelFault) {
        log::warn!("{}: channel fault {:?}, marking module as failed", id, fault);
        inner.set_status(id, ModuleStatus::Error);
        Self::schedule_reconnect(inner, id);
    }

    fn schedule_reconnect(inner: &Arc<Self>, id: &ModuleId) {
        if !inner.running.load(Ordering::SeqCst) {
            return;
        }
        let Some(channel) = inner.modules.read().get(id).map(|e| Arc::clone(&e.channel)) else {
            return;
        };
        if !inner.reconnecting.lock().insert(id.clone()) {
            return;
        }

        let weak = Arc::downgrade(inner);
        let shutdown = inner.shutdown_rx.clone();
        let module = id.clone();
        let spawned = thread::Builder::new()
            .name(format!("reconnect-{}", id))
            .spawn(move || reconnect_loop(weak, module, channel, shutdown));

        match spawned {
            Ok(handle) => {
                let mut workers = inner.workers.lock();
                workers.retain(|h| !h.is_finished());
                workers.push(handle);
            }
            Err(e) => {
                log::error!("{}: failed to spawn reconnect worker: {}", id, e);
                inner.reconnecting.lock().remove(id);
            }
        }
    }
}

fn reconnect_loop(
    weak: Weak<RegistryInner>,
    id: ModuleId,
    channel: Arc<AtChannel>,
    shutdown: Receiver<()>,
) {
    let mut attempt = 0usize;
    loop {
        let delay = channel.settings().backoff(attempt);
        match shutdown.recv_timeout(delay) {
            Err(RecvTimeoutError::Timeout) => {}
            _ => break,
        }
        let Some(inner) = weak.upgrade() else {
            break;
        };
        if !inner.running.load(Ordering::SeqCst) {
            break;
        }

        attempt += 1;
        match channel.connect() {
            Ok(()) => {
                log::info!("{}: reconnected after {} attempt(s)", id, attempt);
                if let Some(entry) = inner.modules.write().get_mut(&id) {
                    entry.missed_polls = 0;
                }
                inner.set_status(&id, ModuleStatus::Connected);
                inner.reconnecting.lock().remove(&id);
                return;
            }
            Err(e) => log::warn!("{}: reconnect attempt {} failed: {}", id, attempt, e),
        }
    }
    if let Some(inner) = weak.upgrade() {
        inner.reconnecting.lock().remove(&id);
    }
}
