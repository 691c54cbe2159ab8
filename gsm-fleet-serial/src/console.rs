//! Line-oriented operator console for the daemon.
//!
//! One command per line, one JSON document per response:
//!
//! ```text
//! modules
//! calls
//! sms <module> <phone> <text...>
//! call <module> <phone>
//! answer <module>
//! hangup <call_id>
//! inbox
//! otp-send <phone> [purpose]
//! otp-verify <phone> <code> [purpose]
//! discover
//! quit
//! ```

use serde_json::{json, Value};

use gsm_fleet_core::Gateway;

use crate::device_discovery;

const DEFAULT_PURPOSE: &str = "registration";

/// What the console loop should do after a line.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Respond(Value),
    Quit,
    Ignore,
}

pub fn handle_line(gateway: &Gateway, line: &str) -> Reply {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return Reply::Ignore;
    };
    let args: Vec<&str> = words.collect();

    let response = match (command, args.as_slice()) {
        ("quit" | "exit", _) => return Reply::Quit,
        ("modules", []) => to_value(gateway.list_modules()),
        ("calls", []) => to_value(gateway.get_active_calls()),
        ("sms", [module, phone, text @ ..]) if !text.is_empty() => {
            to_value(gateway.send_sms(module, phone, &text.join(" ")))
        }
        ("call", [module, phone]) => to_value(gateway.make_call(module, phone)),
        ("answer", [module]) => to_value(gateway.answer_call(module)),
        ("hangup", [call_id]) => to_value(gateway.hang_up(call_id)),
        ("inbox", []) => to_value(gateway.take_received_sms()),
        ("otp-send", [phone]) => to_value(gateway.send_verification_code(phone, DEFAULT_PURPOSE)),
        ("otp-send", [phone, purpose]) => to_value(gateway.send_verification_code(phone, purpose)),
        ("otp-verify", [phone, code]) => to_value(gateway.verify_code(phone, code, DEFAULT_PURPOSE)),
        ("otp-verify", [phone, code, purpose]) => to_value(gateway.verify_code(phone, code, purpose)),
        ("discover", []) => discover(),
        _ => json!({ "success": false, "error": format!("unrecognized command: {}", line.trim()) }),
    };
    Reply::Respond(response)
}

fn discover() -> Value {
    let ports = device_discovery::list_serial_ports();
    let cards = device_discovery::list_capture_cards();
    match (ports, cards) {
        (Ok(ports), Ok(cards)) => json!({ "success": true, "serial_ports": ports, "sound_cards": cards }),
        (Err(e), _) | (_, Err(e)) => json!({ "success": false, "error": e.to_string() }),
    }
}

fn to_value<T: serde::Serialize>(response: T) -> Value {
    serde_json::to_value(response)
        .unwrap_or_else(|e| json!({ "success": false, "error": format!("serialization failed: {}", e) }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gsm_fleet_core::{FleetConfig, Hardware, ModuleConfig, ProviderKind};

    fn gateway() -> Gateway {
        let mut config = FleetConfig {
            provider: ProviderKind::Sim800c,
            simulate: true,
            modules: vec![ModuleConfig::new("m1", "/dev/ttySIM0")],
            ..Default::default()
        };
        config.channel.command_timeout_ms = 300;
        config.channel.read_poll_ms = 10;
        let (hardware, _ports) = Hardware::simulated();
        Gateway::from_config(&config, hardware).unwrap()
    }

    fn respond(gateway: &Gateway, line: &str) -> Value {
        match handle_line(gateway, line) {
            Reply::Respond(value) => value,
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn lists_modules_and_sends_sms() {
        let gateway = gateway();

        let modules = respond(&gateway, "modules");
        assert_eq!(modules[0]["id"], "m1");

        let sms = respond(&gateway, "sms m1 +998901234567 hello there");
        assert_eq!(sms["success"], true);
        assert_eq!(sms["message_id"], "1");
        gateway.shutdown();
    }

    #[test]
    fn blank_quit_and_unknown_lines() {
        let gateway = gateway();
        assert_eq!(handle_line(&gateway, "   "), Reply::Ignore);
        assert_eq!(handle_line(&gateway, "quit"), Reply::Quit);

        let unknown = respond(&gateway, "dance m1");
        assert_eq!(unknown["success"], false);
        let missing_text = respond(&gateway, "sms m1 +998901234567");
        assert_eq!(missing_text["success"], false);
        gateway.shutdown();
    }

    #[test]
    fn hangup_of_unknown_call_is_structured() {
        let gateway = gateway();
        let response = respond(&gateway, "hangup call_missing");
        assert_eq!(response["success"], false);
        assert!(response["error"].as_str().unwrap().contains("call_missing"));
        gateway.shutdown();
    }

    #[test]
    fn answer_without_ring_and_empty_inbox() {
        let gateway = gateway();
        let answer = respond(&gateway, "answer m1");
        assert_eq!(answer["success"], false);
        assert!(answer["error"].as_str().unwrap().contains("no incoming call"));

        assert_eq!(respond(&gateway, "inbox"), json!([]));
        gateway.shutdown();
    }
}
