//! Event dispatch: in-process signals and log-backed channels.

pub mod carrier;
pub mod channel;
pub mod signal;

pub use carrier::{Carrier, MpscCarrier};
pub use channel::{channels, Channel, ChannelRegistry, ChannelState, ChannelStats};
pub use signal::{ReceiverKey, SenderKey, Signal, Subscription};
