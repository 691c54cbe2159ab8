use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;

use crate::channel::{AtChannel, ChannelSession, Completion};
use crate::models::call::is_valid_phone_number;
use crate::models::config::SmsSettings;
use crate::models::error::{ChannelError, SmsError};
use crate::models::module::ModuleId;
use crate::models::sms::ReceivedSms;
use crate::protocol::parse::{parse_cmgr, parse_cmgs};
use crate::registry::ModuleRegistry;
use crate::traits::provider::{SmsProvider, SmsReceipt};

const CTRL_Z: char = '\u{1A}';
const ESC: char = '\u{1B}';

/// Sends text-mode SMS through a module's AT channel.
///
/// ```text
/// AT+CMGF=1            → OK
/// AT+CMGS="<phone>"    → "> "
/// <text><Ctrl-Z>       → +CMGS: <ref> / OK   (or ERROR / +CMS ERROR: n)
/// ```
///
/// The whole exchange runs under one channel session, so health polls and
/// call commands wait until the message is submitted.
///
/// Incoming messages are read with `AT+CMGR=<index>`, removed from the SIM
/// with `AT+CMGD=<index>` and kept in a bounded inbox.
#[derive(Clone)]
pub struct SmsDispatcher {
    registry: ModuleRegistry,
    settings: SmsSettings,
    inbox: Arc<Mutex<VecDeque<ReceivedSms>>>,
}

impl SmsDispatcher {
    pub fn new(registry: ModuleRegistry, settings: SmsSettings) -> Self {
        Self {
            registry,
            settings,
            inbox: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn settings(&self) -> &SmsSettings {
        &self.settings
    }

    /// Send `text` to `phone` via `module_id` and return the message reference.
    pub fn send_sms(&self, module_id: &ModuleId, phone: &str, text: &str) -> Result<String, SmsError> {
        let phone = phone.trim();
        self.validate(phone, text)?;

        let channel = self.online_channel(module_id)?;

        let session = channel.session();
        let result = self.submit(&session, phone, text);
        match result {
            Ok(ref id) => log::info!("{}: SMS to {} accepted, reference {}", module_id, phone, id),
            Err(ref e) => log::warn!("{}: SMS to {} failed: {}", module_id, phone, e),
        }
        result
    }

    /// Send via the best connected module, falling back to the next-best on
    /// a per-module failure.
    pub fn send_via_best(&self, phone: &str, text: &str, min_signal: u8) -> Result<SmsReceipt, SmsError> {
        self.validate(phone.trim(), text)?;

        let candidates = self.registry.ranked_modules(min_signal);
        let mut last_error = SmsError::NoModuleAvailable;
        for module_id in candidates {
            match self.send_sms(&module_id, phone, text) {
                Ok(message_id) => return Ok(SmsReceipt { module_id, message_id }),
                Err(e) => {
                    log::warn!("{}: falling back after SMS failure: {}", module_id, e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Read the message stored at `index` on `module_id`, delete it from the
    /// SIM and append it to the inbox.
    pub fn receive_sms(&self, module_id: &ModuleId, index: u32) -> Result<ReceivedSms, SmsError> {
        let channel = self.online_channel(module_id)?;
        let session = channel.session();
        let timeout = self.settings.prompt_timeout();

        session.send("AT+CMGF=1", timeout)?;
        let response = session.send(&format!("AT+CMGR={}", index), timeout)?;
        let stored = parse_cmgr(&response.lines).ok_or_else(|| {
            SmsError::Channel(ChannelError::Protocol(format!("no message at index {}", index)))
        })?;
        if let Err(e) = session.send(&format!("AT+CMGD={}", index), timeout) {
            log::warn!("{}: failed to delete SMS {}: {}", module_id, index, e);
        }
        drop(session);

        let message = ReceivedSms {
            module_id: module_id.clone(),
            index,
            sender: stored.sender,
            sent_at: stored.timestamp,
            text: stored.text,
            received_at: Utc::now(),
        };
        log::info!("{}: SMS from {} read from index {}", module_id, message.sender, index);

        let mut inbox = self.inbox.lock();
        inbox.push_back(message.clone());
        while inbox.len() > self.settings.inbox_capacity {
            inbox.pop_front();
        }
        Ok(message)
    }

    /// Received messages, oldest first.
    pub fn received_messages(&self) -> Vec<ReceivedSms> {
        self.inbox.lock().iter().cloned().collect()
    }

    /// Remove and return every received message.
    pub fn take_received(&self) -> Vec<ReceivedSms> {
        self.inbox.lock().drain(..).collect()
    }

    fn online_channel(&self, module_id: &ModuleId) -> Result<Arc<AtChannel>, SmsError> {
        let status = self
            .registry
            .status(module_id)
            .ok_or_else(|| SmsError::UnknownModule(module_id.to_string()))?;
        if !status.is_online() {
            return Err(SmsError::ModuleUnavailable(module_id.to_string()));
        }
        self.registry
            .channel(module_id)
            .ok_or_else(|| SmsError::UnknownModule(module_id.to_string()))
    }

    fn validate(&self, phone: &str, text: &str) -> Result<(), SmsError> {
        if !is_valid_phone_number(phone) {
            return Err(SmsError::InvalidNumber(phone.to_string()));
        }
        if text.is_empty() {
            return Err(SmsError::InvalidMessage("message is empty".into()));
        }
        let length = text.chars().count();
        if length > self.settings.max_length {
            return Err(SmsError::InvalidMessage(format!(
                "message is {} characters, limit is {}",
                length, self.settings.max_length
            )));
        }
        if text.contains(CTRL_Z) || text.contains(ESC) {
            return Err(SmsError::InvalidMessage("message contains control characters".into()));
        }
        Ok(())
    }

    fn submit(&self, session: &ChannelSession<'_>, phone: &str, text: &str) -> Result<String, SmsError> {
        session.send("AT+CMGF=1", self.settings.prompt_timeout())?;

        match session.send_for_prompt(&format!("AT+CMGS=\"{}\"", phone), self.settings.prompt_timeout()) {
            Ok(response) if response.completion == Completion::Prompt => {}
            Ok(_) => return Err(SmsError::MissingPrompt),
            Err(ChannelError::Timeout) => return Err(SmsError::MissingPrompt),
            Err(ChannelError::CommandFailed(reason)) => return Err(SmsError::Rejected(reason)),
            Err(e) => return Err(e.into()),
        }

        match session.submit_text(text, self.settings.send_timeout()) {
            Ok(response) => parse_cmgs(&response.lines).ok_or_else(|| {
                SmsError::Channel(ChannelError::Protocol("missing +CMGS reference".into()))
            }),
            Err(ChannelError::Timeout) => Err(SmsError::Timeout),
            Err(ChannelError::CommandFailed(reason)) => Err(SmsError::Rejected(reason)),
            Err(e) => Err(e.into()),
        }
    }
}

impl SmsProvider for SmsDispatcher {
    fn send_sms(&self, module: &ModuleId, phone: &str, text: &str) -> Result<SmsReceipt, SmsError> {
        SmsDispatcher::send_sms(self, module, phone, text).map(|message_id| SmsReceipt {
            module_id: module.clone(),
            message_id,
        })
    }

    fn send_via_best(&self, phone: &str, text: &str, min_signal: u8) -> Result<SmsReceipt, SmsError> {
        SmsDispatcher::send_via_best(self, phone, text, min_signal)
    }
}
