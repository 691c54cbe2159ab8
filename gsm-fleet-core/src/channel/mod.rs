pub mod at_channel;

pub use at_channel::{
    AtChannel, ChannelFault, ChannelSession, Completion, FaultHandler, ResponseLines, Terminator,
    INIT_SEQUENCE,
};
