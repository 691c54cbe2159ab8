pub mod classify;
pub mod line;
pub mod parse;

pub use classify::{classify, FinalResult, LineClass, Notification};
pub use line::{LineAssembler, Token};
