use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};

use crate::audio::AudioCaptureService;
use crate::channel::{AtChannel, Completion};
use crate::models::call::{is_valid_phone_number, CallId, CallRecord, CallSummary};
use crate::models::config::{CallSettings, RecordingSettings};
use crate::models::error::{CallError, ChannelError};
use crate::models::module::{ModuleId, ModuleStatus};
use crate::models::recording_result::RecordingResult;
use crate::models::state::{CallStatus, TerminationReason};
use crate::protocol::Notification;
use crate::registry::ModuleRegistry;
use crate::traits::call_observer::CallObserver;
use crate::traits::encryptor::RecordingEncryptor;

/// How often a supervisor re-checks the module's link while waiting.
const LINK_CHECK_INTERVAL: Duration = Duration::from_millis(250);

enum Control {
    HangUp(Sender<Result<(), CallError>>),
    Shutdown,
}

struct ActiveCall {
    record: CallRecord,
    control: Sender<Control>,
}

struct ControllerInner {
    registry: ModuleRegistry,
    settings: CallSettings,
    recording: RecordingSettings,
    command_timeout: Duration,
    encryptor: Option<Box<dyn RecordingEncryptor>>,
    observer: RwLock<Option<Arc<dyn CallObserver>>>,
    active: Mutex<HashMap<CallId, ActiveCall>>,
    history: Mutex<VecDeque<CallRecord>>,
    supervisors: Mutex<HashMap<CallId, thread::JoinHandle<()>>>,
}

/// Drives calls through `Initiated → Ringing → Active → Ended/Failed`.
///
/// `make_call` dials synchronously up to the `ATD` acknowledgement and
/// `answer_call` picks up a ringing module with `ATA`; each call then gets a
/// supervisor thread that waits on the module's notifications, control
/// messages and the ring/duration deadlines.
#[derive(Clone)]
pub struct CallController {
    inner: Arc<ControllerInner>,
}

impl CallController {
    pub fn new(
        registry: ModuleRegistry,
        settings: CallSettings,
        recording: RecordingSettings,
        command_timeout: Duration,
        encryptor: Option<Box<dyn RecordingEncryptor>>,
    ) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                registry,
                settings,
                recording,
                command_timeout,
                encryptor,
                observer: RwLock::new(None),
                active: Mutex::new(HashMap::new()),
                history: Mutex::new(VecDeque::new()),
                supervisors: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn set_observer(&self, observer: Arc<dyn CallObserver>) {
        *self.inner.observer.write() = Some(observer);
    }

    /// Dial `number` on `module_id`.
    ///
    /// Returns once the modem acknowledged the dial (the call is `Ringing`,
    /// or already `Active` when the acknowledgement was `CONNECT`).
    pub fn make_call(&self, module_id: &ModuleId, number: &str) -> Result<CallId, CallError> {
        let number = number.trim();
        if !is_valid_phone_number(number) {
            return Err(CallError::InvalidNumber(number.to_string()));
        }

        let channel = self.inner.registry.claim_for_call(module_id)?;
        let events = channel.subscribe();
        let mut record = CallRecord::new(module_id.clone(), number);
        let call_id = record.id.clone();
        log::info!("{}: dialing {} on {}", call_id, number, module_id);

        let ack = channel.send_command(&format!("ATD{};", number), self.inner.settings.dial_timeout());
        let answered = match ack {
            Ok(response) => {
                record.transition(CallStatus::Ringing);
                response.completion == Completion::Connect
            }
            Err(e) => return Err(self.fail_dial(record, &channel, &events, e)),
        };
        self.supervise(record, channel, events, answered)
    }

    /// Answer the incoming call ringing on `module_id` with `ATA`.
    ///
    /// The call goes straight to `Active` (recording starts) and is then
    /// supervised like an outgoing one.
    pub fn answer_call(&self, module_id: &ModuleId) -> Result<CallId, CallError> {
        let (channel, caller) = self.inner.registry.claim_incoming(module_id)?;
        let events = channel.subscribe();
        let mut record = CallRecord::incoming(module_id.clone(), caller);
        log::info!("{}: answering call from {} on {}", record.id, record.called, module_id);

        if let Err(e) = channel.send_command("ATA", self.inner.settings.dial_timeout()) {
            log::warn!("{}: answer failed: {}", record.id, e);
            record.transition(CallStatus::Failed);
            record.termination = Some(TerminationReason::AnswerFailed(e.to_string()));
            self.inner.registry.release(module_id);
            let summary = record.summary();
            self.inner.push_history(record);
            self.inner.notify_state(&summary);
            return Err(match e {
                ChannelError::CommandFailed(text) => CallError::AnswerFailed(text),
                other => CallError::Channel(other),
            });
        }
        self.supervise(record, channel, events, true)
    }

    /// Register `record` as active and hand it to a supervisor thread.
    fn supervise(
        &self,
        record: CallRecord,
        channel: Arc<AtChannel>,
        events: Receiver<Notification>,
        answered: bool,
    ) -> Result<CallId, CallError> {
        let call_id = record.id.clone();
        let module_id = record.module_id.clone();
        let (control_tx, control_rx) = unbounded();
        self.inner.active.lock().insert(
            call_id.clone(),
            ActiveCall {
                record: record.clone(),
                control: control_tx,
            },
        );
        self.inner.notify_state(&record.summary());

        let supervisor = Supervisor {
            inner: Arc::clone(&self.inner),
            call_id: call_id.clone(),
            module_id: module_id.clone(),
            channel,
            capture: None,
        };
        let spawned = thread::Builder::new()
            .name(format!("call-{}", call_id))
            .spawn(move || supervisor.run(events, control_rx, answered));

        match spawned {
            Ok(handle) => {
                let mut supervisors = self.inner.supervisors.lock();
                supervisors.retain(|_, h| !h.is_finished());
                supervisors.insert(call_id.clone(), handle);
                Ok(call_id)
            }
            Err(e) => {
                log::error!("{}: failed to spawn call supervisor: {}", call_id, e);
                if let Some(channel) = self.inner.registry.channel(&module_id) {
                    let _ = channel.send_command("ATH", self.inner.command_timeout);
                }
                self.inner.finish(&call_id, CallStatus::Failed, TerminationReason::Shutdown, None);
                Err(CallError::Worker(e.to_string()))
            }
        }
    }

    fn fail_dial(
        &self,
        mut record: CallRecord,
        channel: &AtChannel,
        events: &Receiver<Notification>,
        error: ChannelError,
    ) -> CallError {
        // a BUSY/NO CARRIER that arrived instead of the acknowledgement
        let early = events.try_iter().find_map(|n| match n {
            Notification::Busy => Some(TerminationReason::Busy),
            Notification::NoAnswer | Notification::NoCarrier => Some(TerminationReason::NoAnswer),
            _ => None,
        });
        if error == ChannelError::Timeout {
            let _ = channel.send_command("ATH", self.inner.command_timeout);
        }
        log::warn!("{}: dial failed: {}", record.id, error);

        record.transition(CallStatus::Failed);
        record.termination = Some(early.unwrap_or_else(|| TerminationReason::DialRejected(error.to_string())));
        self.inner.registry.release(&record.module_id);
        let summary = record.summary();
        self.inner.push_history(record);
        self.inner.notify_state(&summary);

        match error {
            ChannelError::CommandFailed(text) => CallError::DialFailed(text),
            other => CallError::Channel(other),
        }
    }

    /// Hang up an ongoing call with `ATH`; it ends as `Ended`.
    pub fn hang_up(&self, call_id: &CallId) -> Result<(), CallError> {
        let control = self
            .inner
            .active
            .lock()
            .get(call_id)
            .map(|call| call.control.clone())
            .ok_or_else(|| CallError::UnknownCall(call_id.to_string()))?;

        let (reply_tx, reply_rx) = bounded(1);
        control
            .send(Control::HangUp(reply_tx))
            .map_err(|_| CallError::UnknownCall(call_id.to_string()))?;
        reply_rx
            .recv_timeout(self.inner.command_timeout + LINK_CHECK_INTERVAL * 2)
            .unwrap_or(Err(CallError::Channel(ChannelError::Timeout)))
    }

    /// Calls that have not reached a terminal state.
    pub fn get_active_calls(&self) -> Vec<CallSummary> {
        let mut calls: Vec<CallSummary> = self
            .inner
            .active
            .lock()
            .values()
            .map(|call| call.record.summary())
            .collect();
        calls.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        calls
    }

    /// Most recent terminal calls, oldest first.
    pub fn call_history(&self) -> Vec<CallSummary> {
        self.inner.history.lock().iter().map(CallRecord::summary).collect()
    }

    pub fn get_call(&self, call_id: &CallId) -> Option<CallSummary> {
        if let Some(call) = self.inner.active.lock().get(call_id) {
            return Some(call.record.summary());
        }
        self.inner
            .history
            .lock()
            .iter()
            .rev()
            .find(|r| &r.id == call_id)
            .map(CallRecord::summary)
    }

    /// End every ongoing call and wait for the supervisors to finish.
    pub fn shutdown(&self) {
        let controls: Vec<Sender<Control>> = self
            .inner
            .active
            .lock()
            .values()
            .map(|call| call.control.clone())
            .collect();
        for control in controls {
            let _ = control.send(Control::Shutdown);
        }
        let supervisors: Vec<_> = self.inner.supervisors.lock().drain().map(|(_, h)| h).collect();
        for handle in supervisors {
            let _ = handle.join();
        }
    }
}

impl ControllerInner {
    fn notify_state(&self, summary: &CallSummary) {
        if let Some(observer) = self.observer.read().clone() {
            observer.on_call_state_changed(summary);
        }
    }

    fn update<F: FnOnce(&mut CallRecord) -> bool>(&self, call_id: &CallId, apply: F) -> Option<CallSummary> {
        let mut active = self.active.lock();
        let call = active.get_mut(call_id)?;
        apply(&mut call.record).then(|| call.record.summary())
    }

    fn push_history(&self, record: CallRecord) {
        let mut history = self.history.lock();
        history.push_back(record);
        while history.len() > self.settings.history_capacity {
            history.pop_front();
        }
    }

    /// Move a call to its terminal state, archive it and free its module.
    fn finish(
        &self,
        call_id: &CallId,
        status: CallStatus,
        reason: TerminationReason,
        recording: Option<RecordingResult>,
    ) {
        let Some(mut call) = self.active.lock().remove(call_id) else {
            return;
        };
        call.record.transition(status);
        call.record.termination = Some(reason);
        call.record.recording_path = recording.as_ref().map(|r| r.file_path.clone());

        let summary = call.record.summary();
        let module_id = call.record.module_id.clone();
        self.push_history(call.record);
        self.registry.release(&module_id);

        if let Some(observer) = self.observer.read().clone() {
            if let Some(ref result) = recording {
                observer.on_recording_finished(&summary, result);
            }
            observer.on_call_state_changed(&summary);
        }
    }
}

/// Per-call state owned by the supervisor thread.
struct Supervisor {
    inner: Arc<ControllerInner>,
    call_id: CallId,
    module_id: ModuleId,
    channel: Arc<AtChannel>,
    capture: Option<AudioCaptureService>,
}

impl Supervisor {
    fn run(mut self, events: Receiver<Notification>, control: Receiver<Control>, answered: bool) {
        let ring_deadline = Instant::now() + self.inner.settings.ring_timeout();
        let mut hangup_deadline: Option<Instant> = None;
        if answered {
            hangup_deadline = Some(self.enter_active());
        }

        let (status, reason) = loop {
            let active = hangup_deadline.is_some();
            let deadline = hangup_deadline.unwrap_or(ring_deadline);
            let wait = deadline
                .saturating_duration_since(Instant::now())
                .min(LINK_CHECK_INTERVAL);

            let outcome = select! {
                recv(events) -> msg => match msg {
                    Ok(Notification::Connect) if !active => {
                        hangup_deadline = Some(self.enter_active());
                        None
                    }
                    Ok(Notification::NoCarrier) if active => {
                        Some((CallStatus::Ended, TerminationReason::RemoteHangup))
                    }
                    Ok(Notification::NoCarrier) | Ok(Notification::NoAnswer) if !active => {
                        Some((CallStatus::Failed, TerminationReason::NoAnswer))
                    }
                    Ok(Notification::Busy) if !active => Some((CallStatus::Failed, TerminationReason::Busy)),
                    Ok(_) => None,
                    Err(_) => Some((CallStatus::Failed, TerminationReason::LinkLost)),
                },
                recv(control) -> msg => match msg {
                    Ok(Control::HangUp(reply)) => {
                        let result = self.send_hangup().map_err(CallError::from);
                        let _ = reply.send(result);
                        Some((CallStatus::Ended, TerminationReason::LocalHangup))
                    }
                    Ok(Control::Shutdown) | Err(_) => {
                        let _ = self.send_hangup();
                        Some((CallStatus::Ended, TerminationReason::Shutdown))
                    }
                },
                default(wait) => self.check_deadline(deadline, active),
            };
            if let Some(outcome) = outcome {
                break outcome;
            }
        };

        let recording = self.capture.take().and_then(|capture| match capture.stop() {
            Ok(result) => Some(result),
            Err(e) => {
                log::error!("{}: failed to finalize recording: {}", self.call_id, e);
                None
            }
        });
        self.inner.finish(&self.call_id, status, reason, recording);
    }

    fn check_deadline(&self, deadline: Instant, active: bool) -> Option<(CallStatus, TerminationReason)> {
        if Instant::now() >= deadline {
            let _ = self.send_hangup();
            if active {
                log::info!("{}: maximum call duration reached", self.call_id);
                return Some((CallStatus::Ended, TerminationReason::MaxDurationReached));
            }
            log::info!("{}: no answer within ring timeout", self.call_id);
            return Some((CallStatus::Failed, TerminationReason::RingTimeout));
        }
        if self.inner.registry.status(&self.module_id) == Some(ModuleStatus::Error) {
            log::warn!("{}: module {} failed during call", self.call_id, self.module_id);
            return Some((CallStatus::Failed, TerminationReason::LinkLost));
        }
        None
    }

    /// Transition to `Active`, start recording once, return the hangup deadline.
    fn enter_active(&mut self) -> Instant {
        let summary = self
            .inner
            .update(&self.call_id, |record| record.transition(CallStatus::Active));
        if let Some(ref summary) = summary {
            self.inner.notify_state(summary);
        }

        if self.capture.is_none() {
            match self.inner.registry.audio_input(&self.module_id) {
                Some(input) => {
                    match AudioCaptureService::start(
                        &self.call_id,
                        &self.module_id,
                        input.as_ref(),
                        &self.inner.recording,
                        self.inner.encryptor.clone(),
                    ) {
                        Ok(capture) => self.capture = Some(capture),
                        Err(e) => log::warn!("{}: recording not started: {}", self.call_id, e),
                    }
                }
                None => log::info!(
                    "{}: no audio device bound to {}, recording skipped",
                    self.call_id,
                    self.module_id
                ),
            }
        }
        Instant::now() + self.inner.settings.max_call_duration()
    }

    fn send_hangup(&self) -> Result<(), ChannelError> {
        self.channel
            .send_command("ATH", self.inner.command_timeout)
            .map(|_| ())
            .map_err(|e| {
                log::warn!("{}: ATH failed: {}", self.call_id, e);
                e
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::config::ChannelSettings;
    use crate::models::module::ModuleConfig;
    use crate::models::call::CallDirection;
    use crate::models::config::SmsSettings;
    use crate::simulator::{DialBehavior, SimulatedAudio, SimulatedPorts};
    use crate::sms::SmsDispatcher;

    const PORT: &str = "/dev/ttySIM0";

    struct Fixture {
        ports: SimulatedPorts,
        registry: ModuleRegistry,
        controller: CallController,
        module: ModuleId,
        recordings: std::path::PathBuf,
    }

    impl Fixture {
        fn new(name: &str, audio: bool) -> Self {
            Self::with_settings(name, audio, CallSettings {
                dial_timeout_ms: 300,
                ring_timeout_ms: 400,
                max_call_duration_secs: 3600,
                history_capacity: 2,
            })
        }

        fn with_settings(name: &str, audio: bool, settings: CallSettings) -> Self {
            let ports = SimulatedPorts::new();
            let channel_settings = ChannelSettings {
                command_timeout_ms: 300,
                retries: 0,
                max_consecutive_timeouts: 5,
                reconnect_backoff_ms: vec![50],
                read_poll_ms: 10,
                late_reply_drain_ms: 30,
            };
            let registry = ModuleRegistry::new(
                Arc::new(ports.clone()),
                Some(Arc::new(SimulatedAudio::new())),
                channel_settings.clone(),
            );
            let mut config = ModuleConfig::new("m1", PORT);
            if audio {
                config.audio_device = Some("hw:1,0".into());
            }
            let module = registry.add_module(&config).unwrap();

            let recordings =
                std::env::temp_dir().join(format!("gsm_fleet_calls_{}_{}", name, std::process::id()));
            let recording = RecordingSettings {
                output_directory: recordings.clone(),
                frame_millis: 10,
                ..Default::default()
            };
            let controller = CallController::new(
                registry.clone(),
                settings,
                recording,
                channel_settings.command_timeout(),
                None,
            );
            Self {
                ports,
                registry,
                controller,
                module,
                recordings,
            }
        }

        fn wait_terminal(&self, call: &CallId) -> CallSummary {
            let deadline = Instant::now() + Duration::from_secs(5);
            while Instant::now() < deadline {
                if let Some(summary) = self.controller.get_call(call) {
                    if summary.status.is_terminal() {
                        return summary;
                    }
                }
                thread::sleep(Duration::from_millis(10));
            }
            panic!("call {} did not terminate", call);
        }

        fn wait_status(&self, call: &CallId, status: CallStatus) -> bool {
            let deadline = Instant::now() + Duration::from_secs(3);
            while Instant::now() < deadline {
                if self.controller.get_call(call).map(|c| c.status) == Some(status) {
                    return true;
                }
                thread::sleep(Duration::from_millis(10));
            }
            false
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.controller.shutdown();
            self.registry.shutdown();
            std::fs::remove_dir_all(&self.recordings).ok();
        }
    }

    #[derive(Default)]
    struct Recorder {
        states: Mutex<Vec<CallStatus>>,
        recordings: Mutex<Vec<RecordingResult>>,
    }

    impl CallObserver for Recorder {
        fn on_call_state_changed(&self, call: &CallSummary) {
            self.states.lock().push(call.status);
        }

        fn on_recording_finished(&self, _call: &CallSummary, result: &RecordingResult) {
            self.recordings.lock().push(result.clone());
        }
    }

    #[test]
    fn unanswered_call_fails_after_ring_timeout() {
        let fx = Fixture::new("ring_timeout", false);
        let modem = fx.ports.modem(PORT);
        modem.set_dial_behavior(DialBehavior::NeverAnswer);

        let call = fx.controller.make_call(&fx.module, "+998901234567").unwrap();
        assert_eq!(fx.controller.get_active_calls().len(), 1);
        assert_eq!(fx.controller.get_active_calls()[0].status, CallStatus::Ringing);

        let summary = fx.wait_terminal(&call);
        assert_eq!(summary.status, CallStatus::Failed);
        assert!(summary.answered_at.is_none());
        assert_eq!(modem.count_of("ATH"), 1);
        assert_eq!(fx.registry.status(&fx.module), Some(ModuleStatus::Connected));
        assert!(fx.controller.get_active_calls().is_empty());
    }

    #[test]
    fn answered_call_records_until_remote_hangup() {
        let fx = Fixture::new("remote_hangup", true);
        let observer = Arc::new(Recorder::default());
        fx.controller.set_observer(observer.clone());
        fx.ports.modem(PORT).set_dial_behavior(DialBehavior::AnswerThenHangup {
            answer_after: Duration::from_millis(50),
            hangup_after: Duration::from_millis(300),
        });

        let call = fx.controller.make_call(&fx.module, "+998901234567").unwrap();
        assert!(fx.wait_status(&call, CallStatus::Active));
        assert_eq!(fx.registry.status(&fx.module), Some(ModuleStatus::Calling));

        let summary = fx.wait_terminal(&call);
        assert_eq!(summary.status, CallStatus::Ended);
        let duration = summary.duration_secs.unwrap();
        assert!(duration > 0.2 && duration < 1.0, "duration {}", duration);

        let path = summary.recording_path.expect("recording path");
        assert!(std::path::Path::new(&path).exists());
        assert_eq!(observer.recordings.lock().len(), 1);
        assert_eq!(
            observer.states.lock().as_slice(),
            &[CallStatus::Ringing, CallStatus::Active, CallStatus::Ended]
        );
        assert_eq!(fx.registry.status(&fx.module), Some(ModuleStatus::Connected));
    }

    #[test]
    fn busy_line_fails_without_active() {
        let fx = Fixture::new("busy", true);
        fx.ports.modem(PORT).set_dial_behavior(DialBehavior::Busy);

        let call = fx.controller.make_call(&fx.module, "+998901234567").unwrap();
        let summary = fx.wait_terminal(&call);
        assert_eq!(summary.status, CallStatus::Failed);
        assert!(summary.answered_at.is_none());
        assert!(summary.recording_path.is_none());
    }

    #[test]
    fn local_hangup_ends_active_call() {
        let fx = Fixture::new("local_hangup", false);
        fx.ports.modem(PORT).set_dial_behavior(DialBehavior::Answer {
            after: Duration::from_millis(20),
        });

        let call = fx.controller.make_call(&fx.module, "+998901234567").unwrap();
        assert!(fx.wait_status(&call, CallStatus::Active));
        fx.controller.hang_up(&call).unwrap();

        let summary = fx.wait_terminal(&call);
        assert_eq!(summary.status, CallStatus::Ended);
        assert!(summary.recording_path.is_none());
        assert!(matches!(
            fx.controller.hang_up(&call),
            Err(CallError::UnknownCall(_))
        ));
    }

    #[test]
    fn hangup_while_ringing_ends_call() {
        let fx = Fixture::new("ringing_hangup", false);
        fx.ports.modem(PORT).set_dial_behavior(DialBehavior::NeverAnswer);

        let call = fx.controller.make_call(&fx.module, "+998901234567").unwrap();
        fx.controller.hang_up(&call).unwrap();
        assert_eq!(fx.wait_terminal(&call).status, CallStatus::Ended);
    }

    #[test]
    fn connect_as_acknowledgement_goes_straight_to_active() {
        let fx = Fixture::new("connect_ack", false);
        fx.ports
            .modem(PORT)
            .set_dial_behavior(DialBehavior::ConnectImmediately);

        let call = fx.controller.make_call(&fx.module, "+998901234567").unwrap();
        assert!(fx.wait_status(&call, CallStatus::Active));
        fx.controller.hang_up(&call).unwrap();
    }

    #[test]
    fn rejected_dial_fails_and_releases_module() {
        let fx = Fixture::new("rejected", false);
        fx.ports.modem(PORT).set_dial_behavior(DialBehavior::Reject);

        let result = fx.controller.make_call(&fx.module, "+998901234567");
        assert_eq!(result, Err(CallError::DialFailed("ERROR".into())));
        assert_eq!(fx.registry.status(&fx.module), Some(ModuleStatus::Connected));
        assert_eq!(fx.controller.call_history().len(), 1);
        assert_eq!(fx.controller.call_history()[0].status, CallStatus::Failed);
    }

    #[test]
    fn busy_module_and_bad_numbers_are_rejected() {
        let fx = Fixture::new("busy_module", false);
        fx.ports.modem(PORT).set_dial_behavior(DialBehavior::NeverAnswer);

        assert!(matches!(
            fx.controller.make_call(&fx.module, "12;ATH"),
            Err(CallError::InvalidNumber(_))
        ));
        let call = fx.controller.make_call(&fx.module, "+998901234567").unwrap();
        assert!(matches!(
            fx.controller.make_call(&fx.module, "+998907654321"),
            Err(CallError::ModuleBusy(_))
        ));
        fx.controller.hang_up(&call).unwrap();
    }

    #[test]
    fn max_duration_hangs_up_active_call() {
        let fx = Fixture::with_settings(
            "max_duration",
            false,
            CallSettings {
                dial_timeout_ms: 300,
                ring_timeout_ms: 400,
                max_call_duration_secs: 0,
                history_capacity: 10,
            },
        );
        fx.ports.modem(PORT).set_dial_behavior(DialBehavior::Answer {
            after: Duration::from_millis(20),
        });

        let call = fx.controller.make_call(&fx.module, "+998901234567").unwrap();
        let summary = fx.wait_terminal(&call);
        assert_eq!(summary.status, CallStatus::Ended);
        assert!(summary.answered_at.is_some());
        assert!(fx.ports.modem(PORT).count_of("ATH") >= 1);
    }

    #[test]
    fn answer_during_sms_still_reaches_the_call() {
        let fx = Fixture::new("answer_during_sms", false);
        let modem = fx.ports.modem(PORT);
        modem.set_dial_behavior(DialBehavior::NeverAnswer);
        let call = fx.controller.make_call(&fx.module, "+998901234567").unwrap();

        // the remote side picks up while the SMS exchange holds the channel
        modem.set_response("AT+CMGF=1", &["CONNECT", "OK"]);
        let sms = SmsDispatcher::new(fx.registry.clone(), SmsSettings::default());
        assert!(sms.send_sms(&fx.module, "+998907654321", "hello").is_ok());

        assert!(fx.wait_status(&call, CallStatus::Active));
        assert_eq!(modem.count_of("ATH"), 0);
        fx.controller.hang_up(&call).unwrap();
        assert!(fx.controller.get_call(&call).unwrap().answered_at.is_some());
    }

    #[test]
    fn incoming_call_is_answered_and_recorded() {
        let fx = Fixture::new("answer_incoming", true);
        let modem = fx.ports.modem(PORT);
        modem.ring_from("+998901112233");
        fx.registry.mark_receiving(&fx.module, Some("+998901112233".into()));

        let call = fx.controller.answer_call(&fx.module).unwrap();
        assert_eq!(modem.count_of("ATA"), 1);
        assert!(fx.wait_status(&call, CallStatus::Active));
        assert_eq!(fx.registry.status(&fx.module), Some(ModuleStatus::Calling));
        let active = fx.controller.get_active_calls();
        assert_eq!(active[0].phone, "+998901112233");
        assert_eq!(active[0].direction, CallDirection::Incoming);

        thread::sleep(Duration::from_millis(100));
        modem.inject("NO CARRIER");
        let summary = fx.wait_terminal(&call);
        assert_eq!(summary.status, CallStatus::Ended);
        assert!(summary.recording_path.is_some());
        assert_eq!(fx.registry.status(&fx.module), Some(ModuleStatus::Connected));
    }

    #[test]
    fn answer_requires_ringing_module() {
        let fx = Fixture::new("answer_idle", false);
        assert!(matches!(
            fx.controller.answer_call(&fx.module),
            Err(CallError::NoIncomingCall(_))
        ));

        // caller hung up before ATA reached the modem
        fx.registry.mark_receiving(&fx.module, None);
        assert_eq!(
            fx.controller.answer_call(&fx.module),
            Err(CallError::AnswerFailed("ERROR".into()))
        );
        assert_eq!(fx.registry.status(&fx.module), Some(ModuleStatus::Connected));
        assert_eq!(fx.controller.call_history()[0].status, CallStatus::Failed);
    }

    #[test]
    fn history_is_bounded() {
        let fx = Fixture::new("history", false);
        fx.ports.modem(PORT).set_dial_behavior(DialBehavior::Reject);
        for _ in 0..3 {
            let _ = fx.controller.make_call(&fx.module, "+998901234567");
        }
        assert_eq!(fx.controller.call_history().len(), 2);
    }
}
