use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("lock closed: no further acquisitions will be granted")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;
