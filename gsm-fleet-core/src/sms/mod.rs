pub mod dispatcher;

pub use dispatcher::SmsDispatcher;
