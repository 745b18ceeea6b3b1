#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] IoError),
    #[error("FS: {0}")]
    Fs(#[from] FsError),
}

#[derive(thiserror::Error, Debug)]
pub enum IoError {
    #[error("Medium: {0}")]
    Medium(#[from] std::io::Error),
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    #[error("Bad image")]
    BadImage,
    #[error("Not found")]
    NotFound,
    #[error("Is a directory")]
    IsADirectory,
    #[error("Not a directory")]
    NotADirectory,
    #[error("No space")]
    NoSpace,
    #[error("Name too long")]
    NameTooLong,
    #[error("Cycle detected")]
    CycleDetected,
}

pub type Result<T> = core::result::Result<T, Error>;
