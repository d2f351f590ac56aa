use crate::openflow::messages::*;
use std::error;
use std::fmt;
use std::io;
use std::result;

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    BadRequest(OfpBadRequestCode, Vec<u8>),
    HelloFailed,
}

impl error::Error for Error {
    fn description(&self) -> &str {
        "OpenFlow protocol error"
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Io(ref e) => write!(f, "{}", e),
            Error::BadRequest(ref code, ref body) => write!(f, "bad request {:?} ({} byte body)", code, body.len()),
            Error::HelloFailed => write!(f, "no common OpenFlow version"),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

pub type Result<T> = result::Result<T, Error>;
