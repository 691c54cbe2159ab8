use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use parking_lot::{Mutex, RwLock};

use crate::models::config::{ChannelSettings, HealthSettings};
use crate::models::module::{ModuleId, ModuleStatus, Telemetry};
use crate::protocol::parse::{parse_cbc, parse_cops, parse_csq};
use crate::protocol::Notification;

use super::module_registry::ModuleRegistry;

/// Result of one telemetry poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Updated(Telemetry),
    /// Another operation holds the channel, or the module is on a call.
    Skipped,
    /// The signal query failed; the value is the consecutive miss count.
    Missed(u32),
    /// Too many misses in a row; a reconnect was scheduled.
    Reconnecting,
}

/// Called with the module and storage index of every `+CMTI`.
pub type MessageHandler = Arc<dyn Fn(&ModuleId, u32) + Send + Sync>;

/// Periodic per-module telemetry polling and unsolicited event handling.
///
/// One thread per module waits on the module's event stream, a poll ticker
/// and a ring-silence ticker. Polls use `try_session`, so they never wait
/// behind a call or SMS and never hold the channel while one is pending.
pub struct HealthMonitor {
    registry: ModuleRegistry,
    settings: HealthSettings,
    channel_settings: ChannelSettings,
    message_handler: Arc<RwLock<Option<MessageHandler>>>,
    watched: Mutex<HashSet<ModuleId>>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
}

impl HealthMonitor {
    pub fn new(
        registry: ModuleRegistry,
        settings: HealthSettings,
        channel_settings: ChannelSettings,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = bounded(0);
        Self {
            registry,
            settings,
            channel_settings,
            message_handler: Arc::new(RwLock::new(None)),
            watched: Mutex::new(HashSet::new()),
            handles: Mutex::new(Vec::new()),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
        }
    }

    /// Route new-message notifications to `handler` (for example to read
    /// and delete the stored SMS).
    pub fn set_message_handler(&self, handler: MessageHandler) {
        *self.message_handler.write() = Some(handler);
    }

    /// Watch every module currently in the registry.
    pub fn start(&self) {
        for id in self.registry.module_ids() {
            self.watch(&id);
        }
    }

    /// Start the poll thread for one module (no-op if already watched).
    pub fn watch(&self, id: &ModuleId) {
        let Some(channel) = self.registry.channel(id) else {
            log::warn!("{}: cannot watch unknown module", id);
            return;
        };
        if self.shutdown_tx.lock().is_none() || !self.watched.lock().insert(id.clone()) {
            return;
        }

        let events = channel.subscribe();
        let ticker = tick(self.settings.poll_interval());
        let ring_check = tick(self.settings.ring_silence() / 2);
        let shutdown = self.shutdown_rx.clone();
        let poller = self.poller(id);

        let spawned = thread::Builder::new()
            .name(format!("health-{}", id))
            .spawn(move || {
                poller.poll();
                loop {
                    let keep_going = select! {
                        recv(events) -> msg => match msg {
                            Ok(notification) => {
                                poller.handle_event(notification);
                                true
                            }
                            Err(_) => false,
                        },
                        recv(ticker) -> _ => {
                            poller.poll();
                            true
                        }
                        recv(ring_check) -> _ => {
                            poller.expire_ring();
                            true
                        }
                        recv(shutdown) -> _ => false,
                    };
                    if !keep_going {
                        break;
                    }
                }
                log::debug!("{}: health monitor stopped", poller.id);
            });

        match spawned {
            Ok(handle) => self.handles.lock().push(handle),
            Err(e) => {
                log::error!("{}: failed to spawn health monitor: {}", id, e);
                self.watched.lock().remove(id);
            }
        }
    }

    /// Poll one module immediately on the calling thread.
    pub fn poll_now(&self, id: &ModuleId) -> PollOutcome {
        self.poller(id).poll()
    }

    fn poller(&self, id: &ModuleId) -> Poller {
        Poller {
            registry: self.registry.clone(),
            settings: self.settings.clone(),
            channel_settings: self.channel_settings.clone(),
            message_handler: Arc::clone(&self.message_handler),
            id: id.clone(),
        }
    }

    pub fn shutdown(&self) {
        if self.shutdown_tx.lock().take().is_none() {
            return;
        }
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        self.watched.lock().clear();
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Poller {
    registry: ModuleRegistry,
    settings: HealthSettings,
    channel_settings: ChannelSettings,
    message_handler: Arc<RwLock<Option<MessageHandler>>>,
    id: ModuleId,
}

impl Poller {
    fn poll(&self) -> PollOutcome {
        match self.registry.status(&self.id) {
            Some(ModuleStatus::Connected) => {}
            _ => return PollOutcome::Skipped,
        }
        let Some(channel) = self.registry.channel(&self.id) else {
            return PollOutcome::Skipped;
        };
        let Some(session) = channel.try_session() else {
            log::debug!("{}: channel busy, skipping health poll", self.id);
            return PollOutcome::Skipped;
        };

        let timeout = self.channel_settings.command_timeout();
        let signal = session.send("AT+CSQ", timeout);
        let Ok(signal) = signal else {
            drop(session);
            return self.miss();
        };
        let battery = session.send("AT+CBC", timeout).ok();
        let operator = session.send("AT+COPS?", timeout).ok();
        drop(session);

        let telemetry = Telemetry {
            signal_strength: parse_csq(&signal.lines),
            battery_level: battery.and_then(|r| parse_cbc(&r.lines)),
            network_operator: operator.and_then(|r| parse_cops(&r.lines)),
        };
        if telemetry.signal_strength.is_none() {
            log::warn!("{}: unparsable signal response {:?}", self.id, signal.lines);
        }
        self.registry.update_telemetry(&self.id, &telemetry);
        log::debug!("{}: telemetry {:?}", self.id, telemetry);
        PollOutcome::Updated(telemetry)
    }

    fn miss(&self) -> PollOutcome {
        let misses = self.registry.record_poll_miss(&self.id);
        log::warn!("{}: health poll missed ({} consecutive)", self.id, misses);
        if misses >= self.settings.max_missed_polls {
            self.registry.mark_failed(&self.id);
            return PollOutcome::Reconnecting;
        }
        PollOutcome::Missed(misses)
    }

    fn handle_event(&self, notification: Notification) {
        match notification {
            Notification::Ring => self.registry.mark_receiving(&self.id, None),
            Notification::CallerId { number } => {
                let caller = (!number.is_empty()).then_some(number);
                self.registry.mark_receiving(&self.id, caller);
            }
            Notification::NoCarrier => self.registry.clear_receiving(&self.id),
            Notification::NewMessage { storage, index } => {
                log::info!("{}: new SMS stored in {} at index {}", self.id, storage, index);
                let handler = self.message_handler.read().clone();
                if let Some(handler) = handler {
                    handler(&self.id, index);
                }
            }
            Notification::Connect | Notification::Busy | Notification::NoAnswer => {}
        }
    }

    fn expire_ring(&self) {
        self.registry.expire_receiving(&self.id, self.settings.ring_silence());
    }
}
