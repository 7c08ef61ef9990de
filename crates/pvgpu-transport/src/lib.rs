pub mod channel;
pub mod access;
pub mod exchange;
pub mod loopback;
pub mod error;

pub use access::{ChannelEndpoint, ChannelGuard};
pub use channel::{ChannelError, VmBusChannel};
pub use error::TransportError;
pub use loopback::{loopback, HostEndpoint, HostRequest, LoopbackChannel};
