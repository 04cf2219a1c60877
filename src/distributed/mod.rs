pub mod comm_buffers;
pub mod dispatcher;
pub mod event_loop;
pub mod executor;
pub mod launcher;
pub mod worker;

use std::{fmt, str::FromStr};

use crate::{
    errors::{Error, Result},
    protocol::Message,
};

/// Header names of the job protocol
pub mod headers {
    pub const CMD: &str = "cmd";
    pub const JOB_NUM: &str = "job-num";
    pub const FUNCTION: &str = "function";
    pub const INCLUDES: &str = "includes";
}

/// Commands sent from workers to the dispatcher. Replies from the dispatcher carry no command:
/// a `function` header means "here is a job", its absence means "no more work".
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Command {
    NewWorker,
    JobResult,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NewWorker => "new-worker",
            Self::JobResult => "job-result",
        }
    }

    /// Extracts the command of a message sent by a worker
    pub fn of(message: &Message) -> Result<Self> {
        message
            .header(headers::CMD)
            .ok_or_else(|| Error::protocol("Missing header \"cmd\""))?
            .parse()
    }
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "new-worker" => Ok(Self::NewWorker),
            "job-result" => Ok(Self::JobResult),
            _ => Err(Error::protocol(format!("Unknown command \"{}\"", s))),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parses the `job-num` header
pub fn job_number(message: &Message) -> Result<usize> {
    message
        .header(headers::JOB_NUM)
        .ok_or_else(|| Error::protocol("Missing header \"job-num\""))?
        .parse()
        .map_err(|_| Error::protocol("Header \"job-num\" is not a non-negative integer"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_round_trip() {
        for command in [Command::NewWorker, Command::JobResult] {
            let message = Message::new("").with_header(headers::CMD, command);
            assert_eq!(Command::of(&message).unwrap(), command);
        }
    }

    #[test]
    fn missing_or_unknown_command() {
        assert!(matches!(
            Command::of(&Message::new("")),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            Command::of(&Message::new("").with_header(headers::CMD, "shutdown")),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn job_number_must_be_numeric() {
        assert_eq!(
            job_number(&Message::new("").with_header(headers::JOB_NUM, 12)).unwrap(),
            12
        );
        assert!(job_number(&Message::new("").with_header(headers::JOB_NUM, "x")).is_err());
        assert!(job_number(&Message::new("")).is_err());
    }
}
