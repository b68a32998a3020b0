use std::io;
use std::io::ErrorKind::{Interrupted, Other};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("websocket protocol error: {0}")]
    Protocol(&'static str),
    #[error("transport error: {0}")]
    Transport(#[source] io::Error),
    #[error("invalid connection state: {0}")]
    State(&'static str),
    #[error("the operation was cancelled")]
    Cancelled,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        // cancellation surfaces from the transport adapter as `Interrupted`
        // and must not be wrapped as a transport failure
        match err.kind() {
            Interrupted => Error::Cancelled,
            _ => Error::Transport(err),
        }
    }
}

impl From<Error> for io::Error {
    fn from(value: Error) -> Self {
        io::Error::new(Other, value)
    }
}
