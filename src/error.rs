use std::io;
use std::str::Utf8Error;

use serde_yaml::Error as YamlError;

#[derive(Debug, Fail)]
pub enum Error {
    #[fail(display = "IO error: {}", _0)]
    IO(io::Error),

    #[fail(display = "Failed to parse config: {}", _0)]
    Config(YamlError),

    #[fail(display = "Buffer underflow: wanted {} bytes, {} readable", wanted, readable)]
    BufferUnderflow { wanted: usize, readable: usize },

    #[fail(display = "Invalid UTF-8 in buffer: {}", _0)]
    Utf8(Utf8Error),
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::IO(error)
    }
}

impl From<YamlError> for Error {
    fn from(error: YamlError) -> Self {
        Error::Config(error)
    }
}

impl Error {
    /// The raw `errno` value, when this error wraps an OS error.
    pub fn os_error(&self) -> Option<i32> {
        match self {
            Error::IO(e) => e.raw_os_error(),
            _ => None,
        }
    }
}
