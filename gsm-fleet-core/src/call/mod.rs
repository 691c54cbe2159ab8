pub mod controller;

pub use controller::CallController;
