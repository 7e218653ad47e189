mod error;
mod iobuf;
mod queue;

pub use error::QueueError;
pub use iobuf::IoBuf;
pub use queue::{FrameQueue, FrameReceiver, FrameSender};
