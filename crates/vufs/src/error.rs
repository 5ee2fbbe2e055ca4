//! Error representation for the server.
//!
//! Every failure a handler produces is eventually surfaced to the client
//! as an `Rerror` whose ename is the `Display` form of the error.

use std::io;

/// Errors raised while decoding messages or serving requests.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failure from the host filesystem or the codec, surfaced by its
    /// message string.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// A 9P-level refusal; the string is sent verbatim as the ename.
    #[error("{0}")]
    Ename(String),
}

impl Error {
    /// The string to place in an `Rerror` response.
    pub fn ename(&self) -> String {
        self.to_string()
    }
}

impl From<String> for Error {
    fn from(ename: String) -> Self {
        Error::Ename(ename)
    }
}

impl From<&str> for Error {
    fn from(ename: &str) -> Self {
        Error::Ename(ename.to_owned())
    }
}
