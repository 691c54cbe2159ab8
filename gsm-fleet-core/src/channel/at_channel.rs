use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};

use crate::models::config::ChannelSettings;
use crate::models::error::ChannelError;
use crate::models::module::ModuleId;
use crate::protocol::{classify, FinalResult, LineAssembler, LineClass, Notification, Token};
use crate::traits::port::PortOpener;

/// Commands replayed after every open.
pub const INIT_SEQUENCE: [&str; 5] = ["AT", "ATE0", "AT+CMGF=1", "AT+CLIP=1", "AT+CHFA=1"];

const CTRL_Z: u8 = 0x1A;
const ESC: u8 = 0x1B;
const READ_CHUNK: usize = 256;

/// What ends the wait for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminator {
    /// `OK`, `CONNECT` or an error line.
    Final,
    /// The SMS text prompt `> ` (error lines still complete the command).
    Prompt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Ok,
    Connect,
    Prompt,
}

/// Data lines collected for one command, plus how it completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseLines {
    pub lines: Vec<String>,
    pub completion: Completion,
}

/// Conditions the owner of a channel must react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelFault {
    /// Too many commands in a row went unanswered.
    RepeatedTimeouts(u32),
    /// The port reported EOF or an I/O error.
    LinkLost(String),
}

pub type FaultHandler = Arc<dyn Fn(&ModuleId, ChannelFault) + Send + Sync>;

struct PendingCommand {
    echo: String,
    terminator: Terminator,
    /// `ATD`/`ATA` may complete with `CONNECT`.
    awaits_connect: bool,
    lines: Vec<String>,
    outcome: Option<Result<Completion, ChannelError>>,
}

impl PendingCommand {
    fn new(echo: &str, terminator: Terminator) -> Self {
        Self {
            echo: echo.to_string(),
            terminator,
            awaits_connect: echo.starts_with("ATD") || echo == "ATA",
            lines: Vec::new(),
            outcome: None,
        }
    }

    fn is_waiting(&self) -> bool {
        self.outcome.is_none()
    }
}

/// State shared between callers and the reader thread.
///
/// Outlives individual links so subscribers keep receiving events across
/// reconnects.
struct Shared {
    module_id: ModuleId,
    pending: Mutex<Option<PendingCommand>>,
    completed: Condvar,
    subscribers: Mutex<Vec<Sender<Notification>>>,
    prompt_open: AtomicBool,
    discard_partial: AtomicBool,
    fault_handler: RwLock<Option<FaultHandler>>,
}

impl Shared {
    fn dispatch(&self, token: Token) {
        match token {
            Token::Prompt => self.dispatch_prompt(),
            Token::Line(line) => self.dispatch_line(line),
        }
    }

    fn dispatch_prompt(&self) {
        self.prompt_open.store(true, Ordering::SeqCst);
        let mut pending = self.pending.lock();
        match pending.as_mut() {
            Some(cmd) if cmd.is_waiting() && cmd.terminator == Terminator::Prompt => {
                log::debug!("{} <- >", self.module_id);
                cmd.outcome = Some(Ok(Completion::Prompt));
                self.completed.notify_all();
            }
            _ => log::debug!("{}: prompt with no command waiting for it", self.module_id),
        }
    }

    fn dispatch_line(&self, line: String) {
        let mut pending = self.pending.lock();
        let command = pending.as_mut().filter(|cmd| cmd.is_waiting());

        if command.as_ref().is_some_and(|cmd| cmd.echo == line) {
            return;
        }
        log::debug!("{} <- {}", self.module_id, line);

        let awaiting_connect = command.as_ref().is_some_and(|cmd| cmd.awaits_connect);
        match classify(&line, awaiting_connect) {
            LineClass::Notification(notification) => {
                drop(pending);
                self.publish(notification);
            }
            LineClass::Final(result) => {
                self.prompt_open.store(false, Ordering::SeqCst);
                let Some(cmd) = command else {
                    log::debug!("{}: stray final result '{}'", self.module_id, line);
                    return;
                };
                cmd.outcome = Some(match result {
                    FinalResult::Ok => Ok(Completion::Ok),
                    FinalResult::Connect => Ok(Completion::Connect),
                    FinalResult::Error(text) => Err(ChannelError::CommandFailed(text)),
                });
                self.completed.notify_all();
            }
            LineClass::Data(text) => match command {
                Some(cmd) => cmd.lines.push(text),
                None => log::debug!("{}: unsolicited line '{}'", self.module_id, text),
            },
        }
    }

    fn publish(&self, notification: Notification) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(notification.clone()).is_ok());
    }

    /// Fail the waiting command (if any) with `error`.
    fn fail_pending(&self, error: ChannelError) {
        let mut pending = self.pending.lock();
        if let Some(cmd) = pending.as_mut().filter(|cmd| cmd.is_waiting()) {
            cmd.outcome = Some(Err(error));
            self.completed.notify_all();
        }
    }

    fn raise_fault(&self, fault: ChannelFault) {
        let handler = self.fault_handler.read().clone();
        match handler {
            Some(handler) => handler(&self.module_id, fault),
            None => log::warn!("{}: unhandled channel fault {:?}", self.module_id, fault),
        }
    }

    fn link_lost(&self, reason: String) {
        log::warn!("{}: serial link lost: {}", self.module_id, reason);
        self.fail_pending(ChannelError::Connection(reason.clone()));
        self.raise_fault(ChannelFault::LinkLost(reason));
    }
}

/// One open serial link and its reader thread.
struct Link {
    writer: Box<dyn Write + Send>,
    running: Arc<AtomicBool>,
    reader: Option<thread::JoinHandle<()>>,
}

/// Line-oriented AT command channel to a single modem.
///
/// A background reader thread assembles lines and routes each one either to
/// the command currently waiting for its response or, for unsolicited
/// notifications, to every subscriber. At most one command is outstanding:
/// callers serialize through [`AtChannel::session`].
pub struct AtChannel {
    port: String,
    baud_rate: u32,
    opener: Arc<dyn PortOpener>,
    settings: ChannelSettings,
    shared: Arc<Shared>,
    link: Mutex<Option<Link>>,
    command_lock: Mutex<()>,
    consecutive_timeouts: AtomicU32,
    /// Set after a timeout; no command is written before this instant.
    drain_until: Mutex<Option<Instant>>,
}

impl AtChannel {
    pub fn new(
        module_id: ModuleId,
        port: &str,
        baud_rate: u32,
        opener: Arc<dyn PortOpener>,
        settings: ChannelSettings,
    ) -> Self {
        Self {
            port: port.to_string(),
            baud_rate,
            opener,
            settings,
            shared: Arc::new(Shared {
                module_id,
                pending: Mutex::new(None),
                completed: Condvar::new(),
                subscribers: Mutex::new(Vec::new()),
                prompt_open: AtomicBool::new(false),
                discard_partial: AtomicBool::new(false),
                fault_handler: RwLock::new(None),
            }),
            link: Mutex::new(None),
            command_lock: Mutex::new(()),
            consecutive_timeouts: AtomicU32::new(0),
            drain_until: Mutex::new(None),
        }
    }

    pub fn module_id(&self) -> &ModuleId {
        &self.shared.module_id
    }

    pub fn settings(&self) -> &ChannelSettings {
        &self.settings
    }

    pub fn set_fault_handler(&self, handler: FaultHandler) {
        *self.shared.fault_handler.write() = Some(handler);
    }

    /// Receive every unsolicited notification from now on.
    ///
    /// The subscription survives reconnects; dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> Receiver<Notification> {
        let (tx, rx) = unbounded();
        self.shared.subscribers.lock().push(tx);
        rx
    }

    pub fn is_open(&self) -> bool {
        self.link.lock().is_some()
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts.load(Ordering::SeqCst)
    }

    /// Close any existing link, reopen the port and replay [`INIT_SEQUENCE`].
    pub fn connect(&self) -> Result<(), ChannelError> {
        let _guard = self.command_lock.lock();
        self.close_link();
        self.open_link()?;
        self.consecutive_timeouts.store(0, Ordering::SeqCst);
        self.drain_until.lock().take();

        for command in INIT_SEQUENCE {
            if let Err(e) = self.exchange_with_retry(command, self.settings.command_timeout()) {
                log::warn!("{}: init command {} failed: {}", self.module_id(), command, e);
                self.close_link();
                return Err(e);
            }
        }
        log::info!("{}: modem initialized on {}", self.module_id(), self.port);
        Ok(())
    }

    pub fn close(&self) {
        let _guard = self.command_lock.lock();
        self.close_link();
    }

    /// Exclusive use of the channel for a sequence of commands.
    pub fn session(&self) -> ChannelSession<'_> {
        ChannelSession {
            channel: self,
            _guard: self.command_lock.lock(),
        }
    }

    /// Like [`session`](Self::session) but gives up if another caller holds the channel.
    pub fn try_session(&self) -> Option<ChannelSession<'_>> {
        self.command_lock.try_lock().map(|guard| ChannelSession {
            channel: self,
            _guard: guard,
        })
    }

    /// Send one command and wait for its final result.
    pub fn send_command(&self, text: &str, timeout: Duration) -> Result<ResponseLines, ChannelError> {
        self.session().send(text, timeout)
    }

    /// Send one command with the default timeout, retrying timeouts.
    pub fn send_command_with_retry(&self, text: &str) -> Result<ResponseLines, ChannelError> {
        self.session().send_with_retry(text, self.settings.command_timeout())
    }

    fn open_link(&self) -> Result<(), ChannelError> {
        let handles = self.opener.open(&self.port, self.baud_rate)?;
        let running = Arc::new(AtomicBool::new(true));
        let reader = spawn_reader(Arc::clone(&self.shared), handles.reader, Arc::clone(&running))
            .map_err(|e| ChannelError::Connection(format!("failed to spawn reader: {}", e)))?;

        self.shared.prompt_open.store(false, Ordering::SeqCst);
        *self.link.lock() = Some(Link {
            writer: handles.writer,
            running,
            reader: Some(reader),
        });
        log::debug!("{}: opened {} at {} baud", self.module_id(), self.port, self.baud_rate);
        Ok(())
    }

    fn close_link(&self) {
        self.shared.fail_pending(ChannelError::NotConnected);
        let link = self.link.lock().take();
        if let Some(mut link) = link {
            link.running.store(false, Ordering::SeqCst);
            drop(link.writer);
            if let Some(handle) = link.reader.take() {
                let _ = handle.join();
            }
            log::debug!("{}: closed {}", self.module_id(), self.port);
        }
    }

    fn write_bytes(&self, bytes: &[u8]) -> Result<(), ChannelError> {
        let result = {
            let mut guard = self.link.lock();
            let link = guard.as_mut().ok_or(ChannelError::NotConnected)?;
            link.writer.write_all(bytes).and_then(|()| link.writer.flush())
        };
        result.map_err(|e| {
            self.shared.raise_fault(ChannelFault::LinkLost(e.to_string()));
            ChannelError::Connection(e.to_string())
        })
    }

    fn exchange(
        &self,
        payload: &[u8],
        echo: &str,
        terminator: Terminator,
        timeout: Duration,
    ) -> Result<ResponseLines, ChannelError> {
        self.drain_late_replies();
        log::debug!("{} -> {}", self.module_id(), echo);
        *self.shared.pending.lock() = Some(PendingCommand::new(echo, terminator));

        if let Err(e) = self.write_bytes(payload) {
            self.shared.pending.lock().take();
            return Err(e);
        }

        let deadline = Instant::now() + timeout;
        let mut pending = self.shared.pending.lock();
        while pending.as_ref().is_some_and(PendingCommand::is_waiting) {
            if self.shared.completed.wait_until(&mut pending, deadline).timed_out() {
                break;
            }
        }
        let command = pending.take();
        drop(pending);

        let Some(command) = command else {
            return Err(ChannelError::NotConnected);
        };
        match command.outcome {
            None => Err(self.on_timeout(echo, terminator)),
            Some(outcome) => {
                self.consecutive_timeouts.store(0, Ordering::SeqCst);
                outcome.map(|completion| ResponseLines {
                    lines: command.lines,
                    completion,
                })
            }
        }
    }

    fn exchange_with_retry(&self, text: &str, timeout: Duration) -> Result<ResponseLines, ChannelError> {
        let mut attempt = 0;
        loop {
            match self.exchange(command_bytes(text).as_slice(), text, Terminator::Final, timeout) {
                Err(ChannelError::Timeout) if attempt < self.settings.retries => {
                    attempt += 1;
                    log::debug!("{}: retrying {} ({}/{})", self.module_id(), text, attempt, self.settings.retries);
                }
                other => return other,
            }
        }
    }

    /// Wait out the drain window of an earlier timeout. With no command
    /// pending, a late reply that arrives meanwhile is logged and dropped.
    fn drain_late_replies(&self) {
        let Some(until) = self.drain_until.lock().take() else {
            return;
        };
        let remaining = until.saturating_duration_since(Instant::now());
        if !remaining.is_zero() {
            log::debug!("{}: draining late replies for {:?}", self.module_id(), remaining);
            thread::sleep(remaining);
        }
    }

    /// Leave the channel in a known state after an unanswered command.
    fn on_timeout(&self, command: &str, terminator: Terminator) -> ChannelError {
        self.shared.discard_partial.store(true, Ordering::SeqCst);
        *self.drain_until.lock() = Some(Instant::now() + self.settings.late_reply_drain());
        let in_prompt = self.shared.prompt_open.swap(false, Ordering::SeqCst);
        if in_prompt || terminator == Terminator::Prompt {
            // abort SMS text entry
            let _ = self.write_bytes(&[ESC]);
        }

        let count = self.consecutive_timeouts.fetch_add(1, Ordering::SeqCst) + 1;
        log::warn!("{}: '{}' timed out ({} consecutive)", self.module_id(), command, count);
        if count >= self.settings.max_consecutive_timeouts {
            self.consecutive_timeouts.store(0, Ordering::SeqCst);
            self.shared.raise_fault(ChannelFault::RepeatedTimeouts(count));
        }
        ChannelError::Timeout
    }
}

impl Drop for AtChannel {
    fn drop(&mut self) {
        self.close_link();
    }
}

/// Exclusive access to a channel, held for a multi-command sequence.
pub struct ChannelSession<'a> {
    channel: &'a AtChannel,
    _guard: MutexGuard<'a, ()>,
}

impl ChannelSession<'_> {
    pub fn module_id(&self) -> &ModuleId {
        self.channel.module_id()
    }

    pub fn send(&self, text: &str, timeout: Duration) -> Result<ResponseLines, ChannelError> {
        self.channel
            .exchange(command_bytes(text).as_slice(), text, Terminator::Final, timeout)
    }

    /// Retries on `Timeout` only, up to the configured retry count.
    pub fn send_with_retry(&self, text: &str, timeout: Duration) -> Result<ResponseLines, ChannelError> {
        self.channel.exchange_with_retry(text, timeout)
    }

    /// Send a command that answers with the `> ` text prompt.
    pub fn send_for_prompt(&self, text: &str, timeout: Duration) -> Result<ResponseLines, ChannelError> {
        self.channel
            .exchange(command_bytes(text).as_slice(), text, Terminator::Prompt, timeout)
    }

    /// Write SMS text followed by Ctrl-Z and wait for the final result.
    pub fn submit_text(&self, text: &str, timeout: Duration) -> Result<ResponseLines, ChannelError> {
        let mut payload = Vec::with_capacity(text.len() + 1);
        payload.extend_from_slice(text.as_bytes());
        payload.push(CTRL_Z);
        self.channel.exchange(&payload, text, Terminator::Final, timeout)
    }

    /// Leave text entry mode without sending.
    pub fn cancel_prompt(&self) -> Result<(), ChannelError> {
        self.channel.shared.prompt_open.store(false, Ordering::SeqCst);
        self.channel.write_bytes(&[ESC])
    }
}

fn command_bytes(text: &str) -> Vec<u8> {
    format!("{}\r\n", text).into_bytes()
}

fn spawn_reader(
    shared: Arc<Shared>,
    mut reader: Box<dyn Read + Send>,
    running: Arc<AtomicBool>,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("at-reader-{}", shared.module_id))
        .spawn(move || {
            let mut assembler = LineAssembler::new();
            let mut buf = [0u8; READ_CHUNK];

            while running.load(Ordering::SeqCst) {
                if shared.discard_partial.swap(false, Ordering::SeqCst) && assembler.has_partial() {
                    log::debug!("{}: discarding partial line", shared.module_id);
                    assembler.reset();
                }
                match reader.read(&mut buf) {
                    Ok(0) => {
                        if running.load(Ordering::SeqCst) {
                            shared.link_lost("port closed".into());
                        }
                        break;
                    }
                    Ok(n) => {
                        for token in assembler.push(&buf[..n]) {
                            shared.dispatch(token);
                        }
                    }
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                        ) => {}
                    Err(e) => {
                        if running.load(Ordering::SeqCst) {
                            shared.link_lost(e.to_string());
                        }
                        break;
                    }
                }
            }
        })
}
