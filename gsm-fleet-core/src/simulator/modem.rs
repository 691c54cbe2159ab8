use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, MutexGuard};

use crate::models::error::ChannelError;
use crate::traits::port::{PortHandles, PortOpener};

/// How long a simulated read blocks when no data is queued.
const READ_POLL: Duration = Duration::from_millis(10);

/// What the simulated network does after `ATD<number>;`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialBehavior {
    /// `OK`, then `CONNECT` after the delay.
    Answer { after: Duration },
    /// `OK`, then `BUSY`.
    Busy,
    /// `OK` and nothing else.
    NeverAnswer,
    /// `OK`, `CONNECT` after `answer_after`, `NO CARRIER` after a further `hangup_after`.
    AnswerThenHangup {
        answer_after: Duration,
        hangup_after: Duration,
    },
    /// `CONNECT` as the dial acknowledgement itself.
    ConnectImmediately,
    /// `ERROR` instead of `OK`.
    Reject,
}

/// What happens after the SMS text is submitted with Ctrl-Z.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmsBehavior {
    /// `+CMGS: <ref>` and `OK`.
    Accept,
    /// `+CMS ERROR: <code>`.
    Reject(u16),
    /// No answer at all.
    Ignore,
}

struct ModemState {
    echo: bool,
    rssi: u32,
    battery: Option<u8>,
    operator: Option<String>,
    silent: bool,
    drop_commands: u32,
    fail_opens: u32,
    prompt_enabled: bool,
    dial: DialBehavior,
    sms: SmsBehavior,
    next_message_ref: u32,
    overrides: HashMap<String, Vec<String>>,
    reply_delays: HashMap<String, Duration>,
    text_entry: bool,
    incoming_call: bool,
    /// Received SMS by storage index: `(sender, timestamp, text)`.
    inbox: HashMap<u32, (String, String, String)>,
    call_generation: u64,
    received: Vec<String>,
    sent_messages: Vec<(String, String)>,
    sms_recipient: Option<String>,
}

impl Default for ModemState {
    fn default() -> Self {
        Self {
            echo: true,
            rssi: 20,
            battery: Some(85),
            operator: Some("Beeline".into()),
            silent: false,
            drop_commands: 0,
            fail_opens: 0,
            prompt_enabled: true,
            dial: DialBehavior::Answer {
                after: Duration::from_millis(50),
            },
            sms: SmsBehavior::Accept,
            next_message_ref: 1,
            overrides: HashMap::new(),
            reply_delays: HashMap::new(),
            text_entry: false,
            incoming_call: false,
            inbox: HashMap::new(),
            call_generation: 0,
            received: Vec::new(),
            sent_messages: Vec::new(),
            sms_recipient: None,
        }
    }
}

struct ModemInner {
    state: Mutex<ModemState>,
    outbound: Mutex<Option<Sender<Vec<u8>>>>,
}

impl ModemInner {
    fn emit(&self, line: &str) {
        self.emit_raw(format!("\r\n{}\r\n", line).as_bytes());
    }

    fn emit_raw(&self, bytes: &[u8]) {
        if let Some(tx) = self.outbound.lock().as_ref() {
            let _ = tx.send(bytes.to_vec());
        }
    }

    /// Emit `line` after `delay` unless a hangup happened in between.
    fn emit_later(self: &Arc<Self>, delay: Duration, lines: Vec<&'static str>) {
        let generation = self.state.lock().call_generation;
        let inner = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("sim-network".into())
            .spawn(move || {
                thread::sleep(delay);
                if inner.state.lock().call_generation == generation {
                    for line in lines {
                        inner.emit(line);
                    }
                }
            });
        if let Err(e) = spawned {
            log::error!("simulator: failed to spawn network thread: {}", e);
        }
    }

    fn handle_command(self: &Arc<Self>, command: String) {
        let mut state = self.state.lock();
        state.received.push(command.clone());
        if state.silent {
            return;
        }
        if state.drop_commands > 0 {
            state.drop_commands -= 1;
            return;
        }
        if let Some(delay) = state.reply_delays.remove(&command) {
            drop(state);
            let inner = Arc::clone(self);
            let spawned = thread::Builder::new()
                .name("sim-late-reply".into())
                .spawn(move || {
                    thread::sleep(delay);
                    let state = inner.state.lock();
                    inner.reply(state, command);
                });
            if let Err(e) = spawned {
                log::error!("simulator: failed to spawn reply thread: {}", e);
            }
            return;
        }
        self.reply(state, command);
    }

    fn reply(self: &Arc<Self>, mut state: MutexGuard<'_, ModemState>, command: String) {
        if state.echo {
            self.emit_raw(format!("{}\r\n", command).as_bytes());
        }
        if let Some(lines) = state.overrides.get(&command).cloned() {
            drop(state);
            for line in lines {
                self.emit(&line);
            }
            return;
        }

        match command.as_str() {
            "AT" | "AT+CMGF=1" | "AT+CLIP=1" | "AT+CHFA=1" => self.emit("OK"),
            "ATE0" => {
                state.echo = false;
                self.emit("OK");
            }
            "ATE1" => {
                state.echo = true;
                self.emit("OK");
            }
            "AT+CSQ" => {
                self.emit(&format!("+CSQ: {},0", state.rssi));
                self.emit("OK");
            }
            "AT+CBC" => match state.battery {
                Some(level) => {
                    self.emit(&format!("+CBC: 0,{},4100", level));
                    self.emit("OK");
                }
                None => self.emit("ERROR"),
            },
            "AT+COPS?" => {
                match state.operator {
                    Some(ref name) => self.emit(&format!("+COPS: 0,0,\"{}\"", name)),
                    None => self.emit("+COPS: 0"),
                }
                self.emit("OK");
            }
            "ATH" => {
                state.call_generation += 1;
                state.incoming_call = false;
                self.emit("OK");
            }
            "ATA" => {
                if state.incoming_call {
                    state.incoming_call = false;
                    self.emit("OK");
                } else {
                    self.emit("ERROR");
                }
            }
            cmd if cmd.starts_with("AT+CMGR=") => {
                let index = cmd["AT+CMGR=".len()..].parse::<u32>().ok();
                match index.and_then(|i| state.inbox.get(&i)) {
                    Some((sender, timestamp, text)) => {
                        self.emit(&format!("+CMGR: \"REC UNREAD\",\"{}\",\"\",\"{}\"", sender, timestamp));
                        self.emit(text);
                        self.emit("OK");
                    }
                    None => self.emit("+CMS ERROR: 321"),
                }
            }
            cmd if cmd.starts_with("AT+CMGD=") => {
                match cmd["AT+CMGD=".len()..].parse::<u32>() {
                    Ok(index) => {
                        state.inbox.remove(&index);
                        self.emit("OK");
                    }
                    Err(_) => self.emit("ERROR"),
                }
            }
            cmd if cmd.starts_with("ATD") => {
                let dial = state.dial.clone();
                drop(state);
                self.dial(dial);
            }
            cmd if cmd.starts_with("AT+CMGS=") => {
                if state.prompt_enabled {
                    state.text_entry = true;
                    state.sms_recipient = crate::protocol::classify::first_quoted(cmd);
                    self.emit_raw(b"\r\n> ");
                }
            }
            _ => self.emit("ERROR"),
        }
    }

    fn dial(self: &Arc<Self>, behavior: DialBehavior) {
        match behavior {
            DialBehavior::Answer { after } => {
                self.emit("OK");
                self.emit_later(after, vec!["CONNECT"]);
            }
            DialBehavior::Busy => {
                self.emit("OK");
                self.emit_later(Duration::from_millis(20), vec!["BUSY"]);
            }
            DialBehavior::NeverAnswer => self.emit("OK"),
            DialBehavior::AnswerThenHangup {
                answer_after,
                hangup_after,
            } => {
                self.emit("OK");
                self.emit_later(answer_after, vec!["CONNECT"]);
                self.emit_later(answer_after + hangup_after, vec!["NO CARRIER"]);
            }
            DialBehavior::ConnectImmediately => self.emit("CONNECT"),
            DialBehavior::Reject => self.emit("ERROR"),
        }
    }

    fn handle_text(&self, text: String) {
        let mut state = self.state.lock();
        state.text_entry = false;
        state.received.push(format!("<sms>{}", text));
        if state.silent {
            return;
        }
        if state.echo {
            self.emit_raw(text.as_bytes());
        }
        match state.sms {
            SmsBehavior::Accept => {
                let reference = state.next_message_ref;
                state.next_message_ref += 1;
                let recipient = state.sms_recipient.take().unwrap_or_default();
                state.sent_messages.push((recipient, text));
                self.emit(&format!("+CMGS: {}", reference));
                self.emit("OK");
            }
            SmsBehavior::Reject(code) => self.emit(&format!("+CMS ERROR: {}", code)),
            SmsBehavior::Ignore => {}
        }
    }
}

/// In-process SIM800C stand-in speaking the AT subset over a fake serial link.
#[derive(Clone)]
pub struct SimulatedModem {
    inner: Arc<ModemInner>,
}

impl Default for SimulatedModem {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedModem {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ModemInner {
                state: Mutex::new(ModemState::default()),
                outbound: Mutex::new(None),
            }),
        }
    }

    /// RSSI on the 0-31 scale (99 = unknown).
    pub fn set_signal(&self, rssi: u32) {
        self.inner.state.lock().rssi = rssi;
    }

    pub fn set_battery(&self, level: Option<u8>) {
        self.inner.state.lock().battery = level;
    }

    pub fn set_operator(&self, operator: Option<&str>) {
        self.inner.state.lock().operator = operator.map(str::to_string);
    }

    pub fn set_echo(&self, echo: bool) {
        self.inner.state.lock().echo = echo;
    }

    /// Stop answering anything (commands are still recorded).
    pub fn set_silent(&self, silent: bool) {
        self.inner.state.lock().silent = silent;
    }

    /// Ignore the next `count` commands.
    pub fn drop_next_commands(&self, count: u32) {
        self.inner.state.lock().drop_commands = count;
    }

    pub fn fail_next_opens(&self, count: u32) {
        self.inner.state.lock().fail_opens = count;
    }

    /// Answer `AT+CMGS` with nothing instead of the prompt.
    pub fn set_prompt_enabled(&self, enabled: bool) {
        self.inner.state.lock().prompt_enabled = enabled;
    }

    pub fn set_dial_behavior(&self, behavior: DialBehavior) {
        self.inner.state.lock().dial = behavior;
    }

    pub fn set_sms_behavior(&self, behavior: SmsBehavior) {
        self.inner.state.lock().sms = behavior;
    }

    pub fn set_next_message_ref(&self, reference: u32) {
        self.inner.state.lock().next_message_ref = reference;
    }

    /// Answer `command` with exactly `lines`.
    pub fn set_response(&self, command: &str, lines: &[&str]) {
        self.inner.state.lock().overrides.insert(
            command.to_string(),
            lines.iter().map(|l| l.to_string()).collect(),
        );
    }

    /// Answer the next `command` after `delay` instead of immediately.
    pub fn set_reply_delay(&self, command: &str, delay: Duration) {
        self.inner
            .state
            .lock()
            .reply_delays
            .insert(command.to_string(), delay);
    }

    /// Start an incoming call from `caller`: `RING` and `+CLIP`.
    pub fn ring_from(&self, caller: &str) {
        self.inner.state.lock().incoming_call = true;
        self.inner.emit("RING");
        self.inner
            .emit(&format!("+CLIP: \"{}\",145,\"\",0,\"\",0", caller));
    }

    /// Store an SMS at `index` and announce it with `+CMTI`.
    pub fn deliver_sms(&self, index: u32, sender: &str, text: &str) {
        self.inner.state.lock().inbox.insert(
            index,
            (sender.to_string(), "24/05/17,10:15:00+20".to_string(), text.to_string()),
        );
        self.inner.emit(&format!("+CMTI: \"SM\",{}", index));
    }

    /// Indices of SMS still stored on the SIM.
    pub fn stored_messages(&self) -> Vec<u32> {
        let mut indices: Vec<u32> = self.inner.state.lock().inbox.keys().copied().collect();
        indices.sort_unstable();
        indices
    }

    /// Emit an unsolicited line such as `RING`.
    pub fn inject(&self, line: &str) {
        self.inner.emit(line);
    }

    /// Every command line received, in order; SMS bodies appear as `<sms>text`.
    pub fn received_commands(&self) -> Vec<String> {
        self.inner.state.lock().received.clone()
    }

    pub fn count_of(&self, command: &str) -> usize {
        self.inner
            .state
            .lock()
            .received
            .iter()
            .filter(|c| c.as_str() == command)
            .count()
    }

    /// `(recipient, text)` of every accepted SMS.
    pub fn sent_messages(&self) -> Vec<(String, String)> {
        self.inner.state.lock().sent_messages.clone()
    }

    fn open_link(&self) -> Result<PortHandles, ChannelError> {
        {
            let mut state = self.inner.state.lock();
            if state.fail_opens > 0 {
                state.fail_opens -= 1;
                return Err(ChannelError::Connection("simulated open failure".into()));
            }
            state.text_entry = false;
        }
        let (tx, rx) = unbounded();
        *self.inner.outbound.lock() = Some(tx);
        Ok(PortHandles {
            reader: Box::new(SimReader {
                rx,
                leftover: Vec::new(),
            }),
            writer: Box::new(SimWriter {
                modem: Arc::clone(&self.inner),
                buf: Vec::new(),
            }),
        })
    }
}

struct SimReader {
    rx: Receiver<Vec<u8>>,
    leftover: Vec<u8>,
}

impl Read for SimReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.leftover.is_empty() {
            match self.rx.recv_timeout(READ_POLL) {
                Ok(bytes) => self.leftover = bytes,
                Err(RecvTimeoutError::Timeout) => return Err(io::ErrorKind::TimedOut.into()),
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        let n = buf.len().min(self.leftover.len());
        buf[..n].copy_from_slice(&self.leftover[..n]);
        self.leftover.drain(..n);
        Ok(n)
    }
}

struct SimWriter {
    modem: Arc<ModemInner>,
    buf: Vec<u8>,
}

impl Write for SimWriter {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        for &byte in bytes {
            let text_entry = self.modem.state.lock().text_entry;
            if text_entry {
                match byte {
                    0x1A => {
                        let text = String::from_utf8_lossy(&self.buf).to_string();
                        self.buf.clear();
                        self.modem.handle_text(text);
                    }
                    0x1B => {
                        self.buf.clear();
                        self.modem.state.lock().text_entry = false;
                    }
                    _ => self.buf.push(byte),
                }
                continue;
            }
            match byte {
                b'\r' => {
                    let command = String::from_utf8_lossy(&self.buf).trim().to_string();
                    self.buf.clear();
                    if !command.is_empty() {
                        self.modem.handle_command(command);
                    }
                }
                b'\n' | 0x1B => {}
                _ => self.buf.push(byte),
            }
        }
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A set of simulated modems keyed by port path.
///
/// Opening an unknown port creates a modem with default behavior.
#[derive(Clone, Default)]
pub struct SimulatedPorts {
    modems: Arc<Mutex<HashMap<String, SimulatedModem>>>,
}

impl SimulatedPorts {
    pub fn new() -> Self {
        Self::default()
    }

    /// The modem behind `port`, created on first use.
    pub fn modem(&self, port: &str) -> SimulatedModem {
        self.modems
            .lock()
            .entry(port.to_string())
            .or_default()
            .clone()
    }
}

impl PortOpener for SimulatedPorts {
    fn open(&self, port: &str, _baud_rate: u32) -> Result<PortHandles, ChannelError> {
        self.modem(port).open_link()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(reader: &mut Box<dyn Read + Send>) -> String {
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        while let Ok(n) = reader.read(&mut buf) {
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        String::from_utf8_lossy(&out).to_string()
    }

    #[test]
    fn answers_signal_query() {
        let ports = SimulatedPorts::new();
        let mut handles = ports.open("/dev/ttySIM0", 9600).unwrap();
        ports.modem("/dev/ttySIM0").set_echo(false);

        handles.writer.write_all(b"AT+CSQ\r\n").unwrap();
        let output = read_all(&mut handles.reader);
        assert!(output.contains("+CSQ: 20,0"));
        assert!(output.contains("OK"));
    }

    #[test]
    fn sms_flow_records_message() {
        let ports = SimulatedPorts::new();
        let modem = ports.modem("/dev/ttySIM0");
        modem.set_echo(false);
        modem.set_next_message_ref(42);
        let mut handles = ports.open("/dev/ttySIM0", 9600).unwrap();

        handles
            .writer
            .write_all(b"AT+CMGS=\"+998901234567\"\r\n")
            .unwrap();
        assert!(read_all(&mut handles.reader).contains('>'));

        handles.writer.write_all(b"hello\x1a").unwrap();
        assert!(read_all(&mut handles.reader).contains("+CMGS: 42"));
        assert_eq!(
            modem.sent_messages(),
            vec![("+998901234567".to_string(), "hello".to_string())]
        );
    }

    #[test]
    fn open_failures_are_counted_down() {
        let ports = SimulatedPorts::new();
        ports.modem("/dev/ttySIM0").fail_next_opens(1);
        assert!(ports.open("/dev/ttySIM0", 9600).is_err());
        assert!(ports.open("/dev/ttySIM0", 9600).is_ok());
    }
}
