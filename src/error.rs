use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The buffer pool has no free frame and every resident page is pinned.
    /// The operation that hit this must release its latches and give up.
    #[error("buffer pool has no evictable frame")]
    OutOfFrames,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
