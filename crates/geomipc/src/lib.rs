pub mod block;
pub mod channel;
pub mod errors;
mod lock;
pub mod paths;
pub mod payload;
pub mod presence;
pub mod receiver;
#[cfg(feature = "tokio")]
pub mod schedule;
pub mod sender;

pub use block::{Command, CommandBlock};
pub use channel::{Channel, ChannelGuard};
pub use errors::GeomIpcError;
pub use presence::Presence;
pub use receiver::{GeometryEngine, Receiver, ReceiverConfig, ReceiverPoll};
#[cfg(feature = "tokio")]
pub use schedule::{PollTask, spawn_request_poller, spawn_result_poller};
pub use sender::{JobResult, Sender, SenderConfig, SenderPoll};
