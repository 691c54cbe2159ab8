pub mod rate_limiter;
pub mod service;

pub use rate_limiter::RateLimiter;
pub use service::{generate_code, normalize_phone, SmsVerificationService};
