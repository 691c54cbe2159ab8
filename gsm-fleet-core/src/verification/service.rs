use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;

use crate::models::call::is_valid_phone_number;
use crate::models::config::VerificationSettings;
use crate::models::error::VerifyError;
use crate::models::verification::{CodeCheck, VerificationRecord};
use crate::traits::clock::Clock;
use crate::traits::provider::SmsProvider;

use super::rate_limiter::RateLimiter;

pub const CODE_LENGTH: usize = 6;

type CodeGenerator = Box<dyn Fn() -> String + Send + Sync>;

/// Issues and checks one-time SMS codes.
///
/// Records are keyed by normalized phone and purpose; a new code for the
/// same key replaces the previous one.
pub struct SmsVerificationService {
    provider: Arc<dyn SmsProvider>,
    settings: VerificationSettings,
    clock: Arc<dyn Clock>,
    limiter: RateLimiter,
    records: Mutex<HashMap<(String, String), VerificationRecord>>,
    last_sweep: Mutex<DateTime<Utc>>,
    generate: CodeGenerator,
}

impl SmsVerificationService {
    pub fn new(provider: Arc<dyn SmsProvider>, settings: VerificationSettings, clock: Arc<dyn Clock>) -> Self {
        let limiter = RateLimiter::new(
            Duration::from_secs(settings.min_resend_interval_secs),
            Duration::from_secs(settings.window_secs),
            settings.max_sends_per_window,
            Arc::clone(&clock),
        );
        let started = clock.now();
        Self {
            provider,
            settings,
            clock,
            limiter,
            records: Mutex::new(HashMap::new()),
            last_sweep: Mutex::new(started),
            generate: Box::new(generate_code),
        }
    }

    /// Replace the random code source.
    pub fn with_code_generator(mut self, generate: impl Fn() -> String + Send + Sync + 'static) -> Self {
        self.generate = Box::new(generate);
        self
    }

    /// Generate a code, deliver it through the best module and store it.
    ///
    /// Rate-limited requests are refused before any module is contacted.
    pub fn send_code(&self, phone: &str, purpose: &str) -> Result<(), VerifyError> {
        self.sweep_if_due();
        let phone = normalize_phone(phone);
        if !is_valid_phone_number(&phone) {
            return Err(VerifyError::InvalidNumber(phone));
        }

        if let Err(retry_after) = self.limiter.try_acquire(&phone) {
            log::warn!("verification for {} rate limited, retry in {}s", phone, retry_after.as_secs());
            return Err(VerifyError::RateLimited { retry_after });
        }

        let code = (self.generate)();
        let text = verification_message(&code, purpose, self.settings.code_ttl_secs);
        let receipt = match self.provider.send_via_best(&phone, &text, self.settings.min_signal) {
            Ok(receipt) => receipt,
            Err(e) => {
                self.limiter.release(&phone);
                log::error!("verification code to {} not delivered: {}", phone, e);
                return Err(e.into());
            }
        };

        let now = self.clock.now();
        let record = VerificationRecord {
            phone: phone.clone(),
            code,
            purpose: purpose.to_string(),
            created_at: now,
            expires_at: now + chrono::Duration::seconds(self.settings.code_ttl_secs as i64),
            attempts: 0,
            max_attempts: self.settings.max_attempts,
            verified: false,
        };
        self.records.lock().insert((phone.clone(), purpose.to_string()), record);
        log::info!(
            "verification code for {} ({}) sent via {}, reference {}",
            phone,
            purpose,
            receipt.module_id,
            receipt.message_id
        );
        Ok(())
    }

    /// Check `code` against the stored record. Every call counts as an attempt.
    pub fn verify_code(&self, phone: &str, code: &str, purpose: &str) -> Result<CodeCheck, VerifyError> {
        let phone = normalize_phone(phone);
        let now = self.clock.now();
        let mut records = self.records.lock();
        let record = records
            .get_mut(&(phone.clone(), purpose.to_string()))
            .ok_or(VerifyError::NotFound)?;

        if record.verified {
            return Err(VerifyError::AlreadyVerified);
        }
        if record.is_expired(now) {
            return Err(VerifyError::CodeExpired);
        }
        if record.attempts_exhausted() {
            return Err(VerifyError::MaxAttemptsExceeded);
        }

        record.attempts += 1;
        let verified = codes_match(&record.code, code.trim());
        if verified {
            record.verified = true;
            log::info!("{} verified for {}", phone, purpose);
        } else {
            log::info!(
                "wrong code for {} ({}), {} attempts left",
                phone,
                purpose,
                record.remaining_attempts()
            );
        }
        Ok(CodeCheck {
            verified,
            remaining_attempts: record.remaining_attempts(),
        })
    }

    /// Drop expired records and stale rate-limit history. Returns the number
    /// of records removed.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(self.clock.now())
    }

    pub fn pending_records(&self) -> usize {
        self.records.lock().len()
    }

    /// Phones with send history inside the rate-limit window.
    pub fn tracked_phones(&self) -> usize {
        self.limiter.tracked_phones()
    }

    /// Purge at most once per `purge_interval_secs`, keeping codes that
    /// expired within the last interval so they still report `CodeExpired`.
    fn sweep_if_due(&self) {
        let now = self.clock.now();
        let interval = chrono::Duration::seconds(self.settings.purge_interval_secs as i64);
        {
            let mut last = self.last_sweep.lock();
            if now - *last < interval {
                return;
            }
            *last = now;
        }
        self.purge_expired_at(now - interval);
    }

    fn purge_expired_at(&self, cutoff: DateTime<Utc>) -> usize {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, record| !record.is_expired(cutoff));
        let removed = before - records.len();
        drop(records);
        self.limiter.prune();
        if removed > 0 {
            log::debug!("purged {} expired verification records", removed);
        }
        removed
    }
}

/// Uniformly random code of [`CODE_LENGTH`] ASCII digits.
pub fn generate_code() -> String {
    format!("{:06}", rand::rng().random_range(0..1_000_000u32))
}

/// Keep digits and `+`; prefix `+` to bare numbers of 10 or more digits.
pub fn normalize_phone(phone: &str) -> String {
    let cleaned: String = phone
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '+')
        .collect();
    if !cleaned.starts_with('+') && cleaned.len() >= 10 {
        format!("+{}", cleaned)
    } else {
        cleaned
    }
}

fn verification_message(code: &str, purpose: &str, ttl_secs: u64) -> String {
    let purpose_text = match purpose {
        "registration" => "account registration",
        "login" => "login verification",
        "phone_change" => "phone number change",
        "password_reset" => "password reset",
        _ => "verification",
    };
    format!(
        "Your code for {}: {}. Valid for {} minutes. Do not share it.",
        purpose_text,
        code,
        (ttl_secs / 60).max(1)
    )
}

fn codes_match(expected: &str, given: &str) -> bool {
    expected.len() == given.len()
        && expected
            .bytes()
            .zip(given.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::error::SmsError;
    use crate::models::module::ModuleId;
    use crate::traits::clock::manual::ManualClock;
    use crate::traits::provider::SmsReceipt;

    #[derive(Default)]
    struct FakeSms {
        sent: Mutex<Vec<(String, String)>>,
        fail: Mutex<bool>,
    }

    impl SmsProvider for FakeSms {
        fn send_sms(&self, module: &ModuleId, phone: &str, text: &str) -> Result<SmsReceipt, SmsError> {
            self.sent.lock().push((phone.to_string(), text.to_string()));
            Ok(SmsReceipt {
                module_id: module.clone(),
                message_id: "1".into(),
            })
        }

        fn send_via_best(&self, phone: &str, text: &str, _min_signal: u8) -> Result<SmsReceipt, SmsError> {
            if *self.fail.lock() {
                return Err(SmsError::NoModuleAvailable);
            }
            self.send_sms(&ModuleId::from("m1"), phone, text)
        }
    }

    fn service(sms: &Arc<FakeSms>, clock: &Arc<ManualClock>) -> SmsVerificationService {
        SmsVerificationService::new(
            Arc::clone(sms) as Arc<dyn SmsProvider>,
            VerificationSettings::default(),
            Arc::clone(clock) as Arc<dyn Clock>,
        )
    }

    #[test]
    fn otp_flow_with_mismatches() {
        let sms = Arc::new(FakeSms::default());
        let clock = Arc::new(ManualClock::new());
        let service = service(&sms, &clock).with_code_generator(|| "482913".to_string());

        service.send_code("+998901234567", "registration").unwrap();
        let (phone, text) = sms.sent.lock()[0].clone();
        assert_eq!(phone, "+998901234567");
        assert!(text.contains("482913"));
        assert!(text.contains("account registration"));

        let first = service.verify_code("+998901234567", "000000", "registration").unwrap();
        assert_eq!(first, CodeCheck { verified: false, remaining_attempts: 2 });
        let second = service.verify_code("+998901234567", "111111", "registration").unwrap();
        assert_eq!(second, CodeCheck { verified: false, remaining_attempts: 1 });
        let third = service.verify_code("+998901234567", "482913", "registration").unwrap();
        assert!(third.verified);

        assert_eq!(
            service.verify_code("+998901234567", "482913", "registration"),
            Err(VerifyError::AlreadyVerified)
        );
    }

    #[test]
    fn exhausted_attempts_are_refused() {
        let sms = Arc::new(FakeSms::default());
        let clock = Arc::new(ManualClock::new());
        let service = service(&sms, &clock).with_code_generator(|| "482913".to_string());

        service.send_code("+998901234567", "login").unwrap();
        for _ in 0..3 {
            service.verify_code("+998901234567", "000000", "login").unwrap();
        }
        assert_eq!(
            service.verify_code("+998901234567", "482913", "login"),
            Err(VerifyError::MaxAttemptsExceeded)
        );
    }

    #[test]
    fn fourth_send_in_window_is_rate_limited_without_delivery() {
        let sms = Arc::new(FakeSms::default());
        let clock = Arc::new(ManualClock::new());
        let service = service(&sms, &clock);

        for _ in 0..3 {
            service.send_code("+998901234567", "registration").unwrap();
            clock.advance_secs(61);
        }
        let result = service.send_code("+998901234567", "registration");
        assert!(matches!(result, Err(VerifyError::RateLimited { .. })));
        assert_eq!(sms.sent.lock().len(), 3);
    }

    #[test]
    fn resend_within_a_minute_is_rate_limited() {
        let sms = Arc::new(FakeSms::default());
        let clock = Arc::new(ManualClock::new());
        let service = service(&sms, &clock);

        service.send_code("+998901234567", "login").unwrap();
        clock.advance_secs(30);
        assert_eq!(
            service.send_code("+998901234567", "login"),
            Err(VerifyError::RateLimited {
                retry_after: Duration::from_secs(30)
            })
        );
    }

    #[test]
    fn code_expires_after_ttl() {
        let sms = Arc::new(FakeSms::default());
        let clock = Arc::new(ManualClock::new());
        let service = service(&sms, &clock).with_code_generator(|| "482913".to_string());

        service.send_code("+998901234567", "login").unwrap();
        clock.advance_secs(300);
        assert!(service.verify_code("+998901234567", "482913", "login").unwrap().verified);

        clock.advance_secs(60);
        service.send_code("+998901234567", "password_reset").unwrap();
        clock.advance_secs(301);
        assert_eq!(
            service.verify_code("+998901234567", "482913", "password_reset"),
            Err(VerifyError::CodeExpired)
        );
        assert_eq!(service.purge_expired(), 2);
        assert_eq!(service.pending_records(), 0);
    }

    #[test]
    fn send_code_sweeps_stale_records_and_history() {
        let sms = Arc::new(FakeSms::default());
        let clock = Arc::new(ManualClock::new());
        let service = service(&sms, &clock);

        for phone in ["+998901000001", "+998901000002", "+998901000003"] {
            service.send_code(phone, "login").unwrap();
        }
        assert_eq!(service.pending_records(), 3);
        assert_eq!(service.tracked_phones(), 3);

        clock.advance_secs(700);
        service.send_code("+998901000004", "login").unwrap();
        assert_eq!(service.pending_records(), 1);
        assert_eq!(service.tracked_phones(), 1);
    }

    #[test]
    fn recently_expired_code_survives_the_sweep() {
        let sms = Arc::new(FakeSms::default());
        let clock = Arc::new(ManualClock::new());
        let service = service(&sms, &clock).with_code_generator(|| "482913".to_string());

        service.send_code("+998901000001", "login").unwrap();
        clock.advance_secs(400);
        service.send_code("+998901000002", "login").unwrap();
        assert_eq!(
            service.verify_code("+998901000001", "482913", "login"),
            Err(VerifyError::CodeExpired)
        );
    }

    #[test]
    fn delivery_failure_does_not_consume_rate_limit() {
        let sms = Arc::new(FakeSms::default());
        let clock = Arc::new(ManualClock::new());
        let service = service(&sms, &clock);

        *sms.fail.lock() = true;
        assert_eq!(
            service.send_code("+998901234567", "login"),
            Err(VerifyError::Delivery(SmsError::NoModuleAvailable))
        );
        assert_eq!(
            service.verify_code("+998901234567", "123456", "login"),
            Err(VerifyError::NotFound)
        );

        *sms.fail.lock() = false;
        assert!(service.send_code("+998901234567", "login").is_ok());
    }

    #[test]
    fn unknown_record_and_bad_number() {
        let sms = Arc::new(FakeSms::default());
        let clock = Arc::new(ManualClock::new());
        let service = service(&sms, &clock);

        assert_eq!(
            service.verify_code("+998901234567", "123456", "login"),
            Err(VerifyError::NotFound)
        );
        assert!(matches!(
            service.send_code("abc", "login"),
            Err(VerifyError::InvalidNumber(_))
        ));
    }

    #[test]
    fn codes_are_six_digits() {
        for _ in 0..200 {
            let code = generate_code();
            assert_eq!(code.len(), CODE_LENGTH);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn phone_normalization() {
        assert_eq!(normalize_phone("+998 (90) 123-45-67"), "+998901234567");
        assert_eq!(normalize_phone("998901234567"), "+998901234567");
        assert_eq!(normalize_phone("112"), "112");
    }

    #[test]
    fn message_names_purpose() {
        let text = verification_message("123456", "phone_change", 300);
        assert!(text.contains("phone number change"));
        assert!(text.contains("5 minutes"));
        assert!(verification_message("123456", "other", 300).contains("verification"));
    }
}
