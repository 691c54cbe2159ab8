pub mod audio;
pub mod call;
pub mod config;
pub mod error;
pub mod module;
pub mod recording_result;
pub mod sms;
pub mod state;
pub mod verification;
