//! Parsers for information responses.
//!
//! Each takes the data lines collected for one command and returns `None`
//! when the expected response line is missing or malformed.

use super::classify::first_quoted;

/// RSSI value the modem reports when signal is unknown.
const RSSI_UNKNOWN: u32 = 99;
const RSSI_MAX: u32 = 31;

fn find_field<'a>(lines: &'a [String], prefix: &str) -> Option<&'a str> {
    lines
        .iter()
        .find_map(|line| line.strip_prefix(prefix))
        .map(str::trim)
}

/// `+CSQ: <rssi>,<ber>` → signal strength in percent.
///
/// `rssi` 0..31 maps linearly to 0..100; 99 (unknown) maps to 0.
pub fn parse_csq(lines: &[String]) -> Option<u8> {
    let body = find_field(lines, "+CSQ:")?;
    let rssi: u32 = body.split(',').next()?.trim().parse().ok()?;
    if rssi == RSSI_UNKNOWN {
        return Some(0);
    }
    Some((rssi.min(RSSI_MAX) * 100 / RSSI_MAX) as u8)
}

/// `+CBC: <bcs>,<bcl>,<voltage>` → battery charge level in percent.
pub fn parse_cbc(lines: &[String]) -> Option<u8> {
    let body = find_field(lines, "+CBC:")?;
    let level: i64 = body.split(',').nth(1)?.trim().parse().ok()?;
    Some(level.clamp(0, 100) as u8)
}

/// `+COPS: <mode>[,<format>,"<oper>"]` → operator name, empty when not
/// registered.
pub fn parse_cops(lines: &[String]) -> Option<String> {
    let body = find_field(lines, "+COPS:")?;
    Some(first_quoted(body).unwrap_or_default())
}

/// `+CMGS: <mr>` → message reference.
pub fn parse_cmgs(lines: &[String]) -> Option<String> {
    let body = find_field(lines, "+CMGS:")?;
    let reference = body.split(',').next()?.trim();
    if reference.is_empty() || !reference.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(reference.to_string())
}

/// A text-mode message read with `AT+CMGR`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// `REC UNREAD`, `REC READ`, ...
    pub status: String,
    pub sender: String,
    /// Service centre timestamp as reported, e.g. `24/05/17,10:15:00+20`.
    pub timestamp: String,
    pub text: String,
}

/// `+CMGR: "<stat>","<oa>","<alpha>","<scts>"` followed by the text lines.
pub fn parse_cmgr(lines: &[String]) -> Option<StoredMessage> {
    let position = lines.iter().position(|line| line.starts_with("+CMGR:"))?;
    let header = &lines[position]["+CMGR:".len()..];
    let fields: Vec<&str> = header.split('"').skip(1).step_by(2).collect();
    let status = fields.first()?.to_string();
    let sender = fields.get(1)?.to_string();
    let timestamp = fields.get(3).map(|t| t.to_string()).unwrap_or_default();
    Some(StoredMessage {
        status,
        sender,
        timestamp,
        text: lines[position + 1..].join("\n"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn csq_scaling() {
        assert_eq!(parse_csq(&lines(&["+CSQ: 20,0"])), Some(64));
        assert_eq!(parse_csq(&lines(&["+CSQ: 31,0"])), Some(100));
        assert_eq!(parse_csq(&lines(&["+CSQ: 0,0"])), Some(0));
        assert_eq!(parse_csq(&lines(&["+CSQ: 99,99"])), Some(0));
    }

    #[test]
    fn csq_missing_or_malformed() {
        assert_eq!(parse_csq(&lines(&[])), None);
        assert_eq!(parse_csq(&lines(&["+CSQ: x,0"])), None);
    }

    #[test]
    fn csq_out_of_range_saturates() {
        assert_eq!(parse_csq(&lines(&["+CSQ: 45,0"])), Some(100));
        assert_eq!(parse_csq(&lines(&["+CSQ: 4294967295,0"])), Some(100));
    }

    #[test]
    fn cbc_uses_charge_level() {
        assert_eq!(parse_cbc(&lines(&["+CBC: 0,85,4100"])), Some(85));
        assert_eq!(parse_cbc(&lines(&["+CBC: 0,130,4100"])), Some(100));
        assert_eq!(parse_cbc(&lines(&["+CBC: 0"])), None);
    }

    #[test]
    fn cops_operator() {
        assert_eq!(
            parse_cops(&lines(&["+COPS: 0,0,\"Beeline\""])),
            Some("Beeline".to_string())
        );
        assert_eq!(parse_cops(&lines(&["+COPS: 0"])), Some(String::new()));
        assert_eq!(parse_cops(&lines(&["OK"])), None);
    }

    #[test]
    fn cmgs_reference() {
        assert_eq!(parse_cmgs(&lines(&["+CMGS: 42"])), Some("42".to_string()));
        assert_eq!(parse_cmgs(&lines(&["+CMGS: "])), None);
        assert_eq!(parse_cmgs(&lines(&["+CSQ: 1,0"])), None);
    }

    #[test]
    fn cmgr_header_and_text() {
        let message = parse_cmgr(&lines(&[
            "+CMGR: \"REC UNREAD\",\"+998901112233\",\"\",\"24/05/17,10:15:00+20\"",
            "Salom",
            "ikkinchi qator",
        ]))
        .unwrap();
        assert_eq!(message.status, "REC UNREAD");
        assert_eq!(message.sender, "+998901112233");
        assert_eq!(message.timestamp, "24/05/17,10:15:00+20");
        assert_eq!(message.text, "Salom\nikkinchi qator");

        assert_eq!(parse_cmgr(&lines(&["+CMGR: 0"])), None);
        assert_eq!(parse_cmgr(&lines(&[])), None);
    }
}
