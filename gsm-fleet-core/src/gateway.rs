//! Boundary API for the business layer.
//!
//! Every operation returns a serializable response; failures are reported
//! in `success`/`error` fields, never as `Err` or a panic.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::models::call::{CallId, CallSummary};
use crate::models::config::FleetConfig;
use crate::models::error::{CallError, InitError, VerifyError};
use crate::models::module::{ModuleId, ModuleSummary};
use crate::models::sms::ReceivedSms;
use crate::models::state::CallStatus;
use crate::provider::{Hardware, Provider};
use crate::traits::clock::{Clock, SystemClock};
use crate::traits::provider::{CallProvider, SmsProvider};
use crate::verification::SmsVerificationService;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendSmsResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MakeCallResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<CallStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HangUpResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendCodeResponse {
    pub success: bool,
    pub message: String,
    /// Seconds until another code may be requested, when rate limited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyCodeResponse {
    pub success: bool,
    pub verified: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_attempts: Option<u32>,
}

/// Entry point the business layer talks to.
pub struct Gateway {
    provider: Provider,
    sms: Arc<dyn SmsProvider>,
    calls: Arc<dyn CallProvider>,
    verification: SmsVerificationService,
}

impl Gateway {
    pub fn new(provider: Provider, config: &FleetConfig, clock: Arc<dyn Clock>) -> Self {
        let sms = provider.sms();
        let calls = provider.calls();
        let verification = SmsVerificationService::new(Arc::clone(&sms), config.verification.clone(), clock);
        Self {
            provider,
            sms,
            calls,
            verification,
        }
    }

    /// Build the configured provider on `hardware` with the system clock.
    pub fn from_config(config: &FleetConfig, hardware: Hardware) -> Result<Self, InitError> {
        let provider = Provider::from_config(config, hardware)?;
        Ok(Self::new(provider, config, Arc::new(SystemClock)))
    }

    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    pub fn verification(&self) -> &SmsVerificationService {
        &self.verification
    }

    pub fn send_sms(&self, module_id: &str, phone: &str, text: &str) -> SendSmsResponse {
        match self.sms.send_sms(&ModuleId::from(module_id), phone, text) {
            Ok(receipt) => SendSmsResponse {
                success: true,
                message_id: Some(receipt.message_id),
                module_id: Some(receipt.module_id.to_string()),
                error: None,
            },
            Err(e) => SendSmsResponse {
                success: false,
                message_id: None,
                module_id: None,
                error: Some(e.to_string()),
            },
        }
    }

    pub fn make_call(&self, module_id: &str, phone: &str) -> MakeCallResponse {
        call_response(self.calls.make_call(&ModuleId::from(module_id), phone))
    }

    /// Answer the call currently ringing on `module_id`.
    pub fn answer_call(&self, module_id: &str) -> MakeCallResponse {
        call_response(self.calls.answer_call(&ModuleId::from(module_id)))
    }

    pub fn hang_up(&self, call_id: &str) -> HangUpResponse {
        match self.calls.hang_up(&CallId::from(call_id)) {
            Ok(()) => HangUpResponse {
                success: true,
                error: None,
            },
            Err(e) => HangUpResponse {
                success: false,
                error: Some(e.to_string()),
            },
        }
    }

    pub fn list_modules(&self) -> Vec<ModuleSummary> {
        self.calls.modules()
    }

    pub fn get_active_calls(&self) -> Vec<CallSummary> {
        self.calls.active_calls()
    }

    /// Drain SMS read from the modules since the last call.
    pub fn take_received_sms(&self) -> Vec<ReceivedSms> {
        match self.provider.fleet() {
            Some(fleet) => fleet.sms().take_received(),
            None => Vec::new(),
        }
    }

    pub fn send_verification_code(&self, phone: &str, purpose: &str) -> SendCodeResponse {
        match self.verification.send_code(phone, purpose) {
            Ok(()) => SendCodeResponse {
                success: true,
                message: "Verification code sent".into(),
                retry_after_secs: None,
            },
            Err(VerifyError::RateLimited { retry_after }) => SendCodeResponse {
                success: false,
                message: "Too many requests. Please wait before requesting another code".into(),
                retry_after_secs: Some(retry_after.as_secs().max(1)),
            },
            Err(VerifyError::Delivery(e)) => {
                log::error!("verification delivery failed: {}", e);
                SendCodeResponse {
                    success: false,
                    message: "Verification service temporarily unavailable".into(),
                    retry_after_secs: None,
                }
            }
            Err(e) => SendCodeResponse {
                success: false,
                message: e.to_string(),
                retry_after_secs: None,
            },
        }
    }

    pub fn verify_code(&self, phone: &str, code: &str, purpose: &str) -> VerifyCodeResponse {
        match self.verification.verify_code(phone, code, purpose) {
            Ok(check) if check.verified => VerifyCodeResponse {
                success: true,
                verified: true,
                message: "Phone number verified successfully".into(),
                remaining_attempts: None,
            },
            Ok(check) => VerifyCodeResponse {
                success: false,
                verified: false,
                message: match check.into_result() {
                    Err(e) => e.to_string(),
                    Ok(()) => String::new(),
                },
                remaining_attempts: Some(check.remaining_attempts),
            },
            Err(e) => VerifyCodeResponse {
                success: false,
                verified: false,
                message: e.to_string(),
                remaining_attempts: None,
            },
        }
    }

    pub fn shutdown(&self) {
        self.provider.shutdown();
    }
}

fn call_response(result: Result<CallSummary, CallError>) -> MakeCallResponse {
    match result {
        Ok(call) => MakeCallResponse {
            success: true,
            call_id: Some(call.call_id.to_string()),
            status: Some(call.status),
            error: None,
        },
        Err(e) => MakeCallResponse {
            success: false,
            call_id: None,
            status: None,
            error: Some(e.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::config::ProviderKind;
    use crate::models::module::{ModuleConfig, ModuleStatus};
    use crate::simulator::{DialBehavior, SimulatedPorts};
    use crate::traits::clock::manual::ManualClock;
    use std::thread;
    use std::time::{Duration, Instant};

    fn config() -> FleetConfig {
        let mut config = FleetConfig {
            provider: ProviderKind::Sim800c,
            simulate: true,
            modules: vec![ModuleConfig::new("m1", "/dev/ttySIM0")],
            ..Default::default()
        };
        config.channel.command_timeout_ms = 300;
        config.channel.read_poll_ms = 10;
        config.sms.prompt_timeout_ms = 300;
        config.sms.send_timeout_ms = 500;
        config.calls.ring_timeout_ms = 300;
        config.calls.dial_timeout_ms = 300;
        config.recording.output_directory =
            std::env::temp_dir().join(format!("gsm_fleet_gateway_{}", std::process::id()));
        config
    }

    fn gateway(clock: Arc<dyn Clock>) -> (Gateway, SimulatedPorts) {
        let (hardware, ports) = Hardware::simulated();
        let config = config();
        let provider = Provider::from_config(&config, hardware).unwrap();
        (Gateway::new(provider, &config, clock), ports)
    }

    fn wait_for_signal(gateway: &Gateway) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if gateway.list_modules().iter().all(|m| m.signal_strength > 0) {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("modules were never polled");
    }

    #[test]
    fn send_sms_reports_message_id() {
        let (gateway, ports) = gateway(Arc::new(SystemClock));
        ports.modem("/dev/ttySIM0").set_next_message_ref(42);

        let response = gateway.send_sms("m1", "+998901234567", "hi");
        assert_eq!(
            response,
            SendSmsResponse {
                success: true,
                message_id: Some("42".into()),
                module_id: Some("m1".into()),
                error: None,
            }
        );
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["message_id"], "42");
        gateway.shutdown();
    }

    #[test]
    fn failures_are_structured() {
        let (gateway, _ports) = gateway(Arc::new(SystemClock));

        let sms = gateway.send_sms("m9", "+998901234567", "hi");
        assert!(!sms.success);
        assert!(sms.error.unwrap().contains("m9"));

        let call = gateway.make_call("m1", "not a number");
        assert!(!call.success);
        assert!(call.call_id.is_none());

        let hangup = gateway.hang_up("call_missing");
        assert!(!hangup.success);
        gateway.shutdown();
    }

    #[test]
    fn unanswered_call_fails_after_ring_timeout() {
        let (gateway, ports) = gateway(Arc::new(SystemClock));
        let modem = ports.modem("/dev/ttySIM0");
        modem.set_dial_behavior(DialBehavior::NeverAnswer);

        let response = gateway.make_call("m1", "+998901234567");
        assert!(response.success);
        assert_eq!(response.status, Some(CallStatus::Ringing));
        assert_eq!(gateway.get_active_calls().len(), 1);

        let deadline = Instant::now() + Duration::from_secs(3);
        while !gateway.get_active_calls().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(gateway.get_active_calls().is_empty());
        assert_eq!(modem.count_of("ATH"), 1);

        let fleet = gateway.provider().fleet().unwrap();
        let history = fleet.calls().call_history();
        assert_eq!(history[0].status, CallStatus::Failed);
        gateway.shutdown();
    }

    #[test]
    fn answered_call_is_recorded_until_remote_hangup() {
        let (gateway, ports) = gateway(Arc::new(SystemClock));
        ports.modem("/dev/ttySIM0").set_dial_behavior(DialBehavior::AnswerThenHangup {
            answer_after: Duration::from_millis(20),
            hangup_after: Duration::from_millis(500),
        });

        let response = gateway.make_call("m1", "+998901234567");
        let call_id = CallId::from(response.call_id.unwrap().as_str());
        let fleet = Arc::clone(gateway.provider().fleet().unwrap());

        let deadline = Instant::now() + Duration::from_secs(3);
        let summary = loop {
            match fleet.calls().get_call(&call_id) {
                Some(call) if call.status.is_terminal() => break call,
                _ if Instant::now() > deadline => panic!("call never ended"),
                _ => thread::sleep(Duration::from_millis(10)),
            }
        };
        assert_eq!(summary.status, CallStatus::Ended);
        approx::assert_abs_diff_eq!(summary.duration_secs.unwrap(), 0.5, epsilon = 0.25);
        let path = summary.recording_path.unwrap();
        assert!(std::path::Path::new(&path).exists());

        std::fs::remove_dir_all(config().recording.output_directory).ok();
        gateway.shutdown();
    }

    #[test]
    fn ringing_module_can_be_answered() {
        let (gateway, ports) = gateway(Arc::new(SystemClock));
        let modem = ports.modem("/dev/ttySIM0");

        let idle = gateway.answer_call("m1");
        assert!(!idle.success);
        assert!(idle.error.unwrap().contains("no incoming call"));

        modem.ring_from("+998907654321");
        let deadline = Instant::now() + Duration::from_secs(3);
        while gateway.list_modules()[0].status != ModuleStatus::Receiving {
            assert!(Instant::now() < deadline, "ring was never seen");
            thread::sleep(Duration::from_millis(10));
        }

        let response = gateway.answer_call("m1");
        assert!(response.success, "{:?}", response.error);
        assert_eq!(modem.count_of("ATA"), 1);

        let deadline = Instant::now() + Duration::from_secs(3);
        let active = loop {
            let calls = gateway.get_active_calls();
            if calls.iter().any(|c| c.status == CallStatus::Active) {
                break calls;
            }
            assert!(Instant::now() < deadline, "answered call never became active");
            thread::sleep(Duration::from_millis(10));
        };
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].phone, "+998907654321");

        assert!(gateway.hang_up(response.call_id.as_deref().unwrap()).success);
        std::fs::remove_dir_all(config().recording.output_directory).ok();
        gateway.shutdown();
    }

    #[test]
    fn otp_round_trip_through_modem() {
        let clock = Arc::new(ManualClock::new());
        let (gateway, ports) = gateway(Arc::clone(&clock) as Arc<dyn Clock>);
        wait_for_signal(&gateway);

        let sent = gateway.send_verification_code("+998901234567", "login");
        assert!(sent.success, "{}", sent.message);

        let messages = ports.modem("/dev/ttySIM0").sent_messages();
        assert_eq!(messages.len(), 1);
        let code: String = messages[0]
            .1
            .split(": ")
            .nth(1)
            .unwrap()
            .chars()
            .take(6)
            .collect();

        let wrong = gateway.verify_code("+998901234567", "000000", "login");
        assert!(!wrong.verified);
        if code != "000000" {
            assert_eq!(wrong.remaining_attempts, Some(2));
            let right = gateway.verify_code("+998901234567", &code, "login");
            assert!(right.success && right.verified);
        }

        let limited = gateway.send_verification_code("+998901234567", "login");
        assert!(!limited.success);
        assert_eq!(limited.retry_after_secs, Some(60));
        assert_eq!(ports.modem("/dev/ttySIM0").sent_messages().len(), 1);
        gateway.shutdown();
    }

    #[test]
    fn list_modules_serializes() {
        let (gateway, _ports) = gateway(Arc::new(SystemClock));
        let json = serde_json::to_value(gateway.list_modules()).unwrap();
        assert_eq!(json[0]["id"], "m1");
        assert_eq!(json[0]["status"], "connected");
        gateway.shutdown();
    }
}
