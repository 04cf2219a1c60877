use std::{
    collections::VecDeque,
    io::{Read, Write},
    os::unix::net::UnixStream,
    path::Path,
    time::Duration,
};

use log::{debug, error, trace};

use crate::{
    distributed::{executor::JobExecutor, headers, job_number, Command},
    errors::{Error, Result},
    protocol::{Message, MessageAssembler},
};

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// How long to wait for the next job. `None` waits forever.
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub read_chunk_size: usize,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            // The first job may take as long as a whole batch of other workers' jobs
            read_timeout: Some(Duration::from_secs(60)),
            write_timeout: Some(Duration::from_secs(3)),
            read_chunk_size: 1500,
        }
    }
}

/// Counterpart of the dispatcher running inside each worker process. Registers once, then
/// executes jobs one after the other until the dispatcher hangs up.
pub struct Worker<E> {
    connection: UnixStream,
    assembler: MessageAssembler,
    // Completed messages not handled yet
    inbox: VecDeque<Message>,
    scratch: Vec<u8>,
    executor: E,
    is_set_up: bool,
    options: WorkerOptions,
}

impl<E> Worker<E>
where
    E: JobExecutor,
{
    pub fn connect<P>(socket_path: P, executor: E, options: WorkerOptions) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        Self::from_stream(UnixStream::connect(socket_path)?, executor, options)
    }

    /// Uses an already connected stream, e.g. one half of a socket pair
    pub fn from_stream(
        connection: UnixStream,
        executor: E,
        options: WorkerOptions,
    ) -> Result<Self> {
        connection.set_read_timeout(options.read_timeout)?;
        connection.set_write_timeout(options.write_timeout)?;
        Ok(Self {
            connection,
            assembler: MessageAssembler::new(),
            inbox: VecDeque::new(),
            scratch: vec![0; options.read_chunk_size.max(1)],
            executor,
            is_set_up: false,
            options,
        })
    }

    /// Returns `Ok(())` once the dispatcher has closed the connection
    pub fn run(&mut self) -> Result<()> {
        self.send(&Message::new("").with_header(headers::CMD, Command::NewWorker))?;

        loop {
            let job = match self.read_message()? {
                Some(job) => job,
                None => {
                    debug!("The dispatcher has dropped the connection, shutting down gracefully");
                    return Ok(());
                }
            };

            if job.header(headers::FUNCTION).is_none() {
                debug!("No more jobs, shutting down");
                return Ok(());
            }

            if let Err(e) = self.execute(&job) {
                error!("Could not execute job: {}", e);
                return Err(e);
            }
        }
    }

    fn execute(&mut self, job: &Message) -> Result<()> {
        if let Some(includes) = job.header(headers::INCLUDES) {
            if !self.is_set_up {
                let includes = includes
                    .split(',')
                    .map(str::trim)
                    .filter(|include| !include.is_empty())
                    .collect::<Vec<_>>();
                self.executor.setup(&includes)?;
                self.is_set_up = true;
            }
        }

        let job_number = job_number(job)?;
        let function_name = job.header(headers::FUNCTION).unwrap_or_default();
        let function = self
            .executor
            .resolve(function_name)
            .ok_or_else(|| Error::UnknownFunction(function_name.to_owned()))?;

        trace!("Run job {} ({})", job_number, function_name);
        let output = function(job.body());

        self.send(
            &Message::new(output)
                .with_header(headers::CMD, Command::JobResult)
                .with_header(headers::JOB_NUM, job_number),
        )
    }

    fn send(&mut self, message: &Message) -> Result<()> {
        let bytes = message.encode()?;
        self.connection
            .write_all(&bytes)
            .map_err(|e| Error::from_blocking_io(e, self.options.write_timeout))
    }

    /// Reads the next message in a blocking way. `None` means the connection has been closed in
    /// between two messages.
    fn read_message(&mut self) -> Result<Option<Message>> {
        loop {
            if let Some(message) = self.inbox.pop_front() {
                return Ok(Some(message));
            }

            let bytes_read = match self.connection.read(&mut self.scratch) {
                Ok(bytes_read) => bytes_read,
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::from_blocking_io(e, self.options.read_timeout)),
            };

            if bytes_read == 0 {
                return if self.assembler.is_idle() {
                    Ok(None)
                } else {
                    Err(Error::ConnectionClosed)
                };
            }

            self.inbox
                .extend(self.assembler.feed(&self.scratch[..bytes_read])?);
        }
    }
}
