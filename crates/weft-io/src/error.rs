use thiserror::Error;

#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue capacity too small, need at least {0} bytes")]
    TooSmall(usize),
}
