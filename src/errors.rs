use core::fmt;
use std::{error, io, result, time::Duration};

/// Internally, we only use this Error type and a newtype wrapper around `std::result::Result<T, E>`
/// where `E` is fixed. Every failure aborts the current run and ends up here, there is no
/// partial success.
#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    ConnectionClosed,
    Timeout(Duration),
    Protocol(String),
    UnknownJob(usize),
    DuplicateResult(usize),
    UnknownFunction(String),
    Stopped,
    UnknownConnection,
    InvalidWorkerCount,
}

impl fmt::Display for Error {
    #[cold]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "IO error: {}", err),
            Error::ConnectionClosed => write!(f, "Peer unexpectedly closed the connection"),
            Error::Timeout(after) => write!(f, "No socket activity for {:?}", after),
            Error::Protocol(err) => write!(f, "Protocol error: {}", err),
            Error::UnknownJob(job_number) => write!(
                f,
                "Received a result for job {} which has never been dispatched",
                job_number
            ),
            Error::DuplicateResult(job_number) => {
                write!(f, "Received more than one result for job {}", job_number)
            }
            Error::UnknownFunction(name) => write!(f, "Job function \"{}\" is unknown", name),
            Error::Stopped => write!(f, "Can not send messages after the event loop was stopped"),
            Error::UnknownConnection => write!(f, "No such connection"),
            Error::InvalidWorkerCount => write!(f, "At least one worker is required"),
        }
    }
}

impl From<io::Error> for Error {
    #[cold]
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl Error {
    pub(crate) fn protocol<T>(msg: T) -> Self
    where
        T: Into<String>,
    {
        Error::Protocol(msg.into())
    }

    /// Blocking sockets report an expired `SO_RCVTIMEO`/`SO_SNDTIMEO` as either `WouldBlock`
    /// or `TimedOut`, depending on the platform
    pub(crate) fn from_blocking_io(e: io::Error, timeout: Option<Duration>) -> Self {
        match (e.kind(), timeout) {
            (io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut, Some(timeout)) => {
                Error::Timeout(timeout)
            }
            _ => Error::Io(e),
        }
    }
}

pub type Result<T> = result::Result<T, Error>;
