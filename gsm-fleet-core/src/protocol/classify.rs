//! Demultiplexing of response lines.
//!
//! Precedence, applied to every complete line:
//! 1. Lines matching a notification prefix (`RING`, `+CRING:`, `+CLIP:`,
//!    `+CMTI:`, `NO CARRIER`, `BUSY`, `NO ANSWER`) always go to the event
//!    stream, even while a command is pending.
//! 2. `CONNECT` completes a pending `ATD`/`ATA` and is a notification
//!    otherwise, so an answer arriving during an unrelated command still
//!    reaches the call supervisor.
//! 3. `OK`, `ERROR`, `+CME ERROR:`, `+CMS ERROR:` complete the pending command.
//! 4. Everything else is data for the pending command.
//!
//! Queries whose answers share a notification prefix (`AT+CLIP?`) are
//! therefore never issued.

use serde::{Deserialize, Serialize};

/// Unsolicited modem events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notification {
    Ring,
    CallerId { number: String },
    NewMessage { storage: String, index: u32 },
    Connect,
    NoCarrier,
    Busy,
    NoAnswer,
}

/// How a pending command finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalResult {
    Ok,
    Connect,
    /// The full error line, e.g. `+CMS ERROR: 500`.
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineClass {
    Notification(Notification),
    Final(FinalResult),
    Data(String),
}

/// `awaiting_connect` is true only while a dial or answer command is pending.
pub fn classify(line: &str, awaiting_connect: bool) -> LineClass {
    if let Some(notification) = parse_notification(line) {
        return LineClass::Notification(notification);
    }
    if line.starts_with("CONNECT") {
        return if awaiting_connect {
            LineClass::Final(FinalResult::Connect)
        } else {
            LineClass::Notification(Notification::Connect)
        };
    }
    if line == "OK" {
        return LineClass::Final(FinalResult::Ok);
    }
    if line == "ERROR" || line.starts_with("+CME ERROR:") || line.starts_with("+CMS ERROR:") {
        return LineClass::Final(FinalResult::Error(line.to_string()));
    }
    LineClass::Data(line.to_string())
}

fn parse_notification(line: &str) -> Option<Notification> {
    match line {
        "RING" => return Some(Notification::Ring),
        "NO CARRIER" => return Some(Notification::NoCarrier),
        "BUSY" => return Some(Notification::Busy),
        "NO ANSWER" => return Some(Notification::NoAnswer),
        _ => {}
    }
    if line.starts_with("+CRING:") {
        return Some(Notification::Ring);
    }
    if let Some(rest) = line.strip_prefix("+CLIP:") {
        let number = first_quoted(rest).unwrap_or_default();
        return Some(Notification::CallerId { number });
    }
    if let Some(rest) = line.strip_prefix("+CMTI:") {
        let mut parts = rest.split(',');
        let storage = parts
            .next()
            .map(|s| s.trim().trim_matches('"').to_string())
            .unwrap_or_default();
        let index = parts.next().and_then(|s| s.trim().parse().ok()).unwrap_or(0);
        return Some(Notification::NewMessage { storage, index });
    }
    None
}

/// Contents of the first `"..."` in `text`.
pub fn first_quoted(text: &str) -> Option<String> {
    let start = text.find('"')? + 1;
    let len = text[start..].find('"')?;
    Some(text[start..start + len].to_string())
}
