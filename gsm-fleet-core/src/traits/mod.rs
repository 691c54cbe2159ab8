pub mod audio_input;
pub mod call_observer;
pub mod clock;
pub mod encryptor;
pub mod port;
pub mod provider;
