use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    process,
    time::{SystemTime, UNIX_EPOCH},
};

use log::{debug, info};

use crate::{
    distributed::{
        event_loop::{ConnectionId, EventLoop, LoopOptions, Outbox},
        headers,
        job_number,
        launcher::WorkerLauncher,
        Command,
    },
    errors::{Error, Result},
    protocol::Message,
};

/// One unit of work, numbered in submission order
#[derive(Debug, Clone)]
struct Job {
    function: String,
    payload: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    pub loop_options: LoopOptions,
    /// Where to bind the listening socket. Defaults to a unique path in the temp dir.
    pub socket_path: Option<PathBuf>,
}

/// Hands out jobs to whichever worker asks for one and collects their results
pub struct Server<L> {
    worker_count: usize,
    launcher: L,
    options: ServerOptions,
    jobs: Vec<Job>,
    worker_includes: Vec<String>,
}

impl<L> Server<L>
where
    L: WorkerLauncher,
{
    pub fn new(worker_count: usize, launcher: L) -> Result<Self> {
        Self::with_options(worker_count, launcher, ServerOptions::default())
    }

    pub fn with_options(worker_count: usize, launcher: L, options: ServerOptions) -> Result<Self> {
        if worker_count < 1 {
            return Err(Error::InvalidWorkerCount);
        }
        Ok(Self {
            worker_count,
            launcher,
            options,
            jobs: Vec::new(),
            worker_includes: Vec::new(),
        })
    }

    /// Queues a job and returns its job number
    pub fn submit<S, P>(&mut self, function: S, payload: P) -> usize
    where
        S: Into<String>,
        P: Into<Vec<u8>>,
    {
        self.jobs.push(Job {
            function: function.into(),
            payload: payload.into(),
        });
        self.jobs.len() - 1
    }

    /// Identifier each worker receives once, with its first job, for one-time setup
    pub fn add_worker_include<S>(&mut self, include: S)
    where
        S: Into<String>,
    {
        self.worker_includes.push(include.into());
    }

    pub fn num_jobs(&self) -> usize {
        self.jobs.len()
    }

    /// Runs all submitted jobs and returns their results ordered by job number
    pub fn run(&mut self) -> Result<Vec<Vec<u8>>> {
        self.run_with(|_, _| {})
    }

    /// Like `run()`, but additionally reports every result as soon as it arrives
    pub fn run_with<F>(&mut self, on_result: F) -> Result<Vec<Vec<u8>>>
    where
        F: FnMut(usize, &[u8]),
    {
        // The batch is consumed either way
        let jobs = std::mem::take(&mut self.jobs);
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        let socket_path = self
            .options
            .socket_path
            .clone()
            .unwrap_or_else(unique_socket_path);
        let socket_file = SocketFile::bind_path(socket_path)?;

        let mut dispatch = DispatchState::new(&jobs, &self.worker_includes, on_result);
        let mut event_loop = EventLoop::new(self.options.loop_options.clone())?;
        event_loop.listen(socket_file.path())?;

        let num_workers = self.worker_count.min(jobs.len());
        info!(
            "Dispatching {} jobs to {} workers via {}",
            jobs.len(),
            num_workers,
            socket_file.path().display()
        );
        let handles = self.launcher.launch(num_workers, socket_file.path())?;

        event_loop.subscribe(|message, connection, control| {
            dispatch.handle(message, connection, control)
        });
        let out = event_loop.run();
        drop(event_loop);

        for handle in handles {
            self.launcher.terminate(handle);
        }
        drop(socket_file);

        out?;
        Ok(dispatch.into_results())
    }
}

/// The job distribution state machine, independent of any sockets
struct DispatchState<'a, F> {
    jobs: &'a [Job],
    worker_includes: &'a [String],
    next_job: usize,
    results: BTreeMap<usize, Vec<u8>>,
    on_result: F,
}

impl<'a, F> DispatchState<'a, F>
where
    F: FnMut(usize, &[u8]),
{
    fn new(jobs: &'a [Job], worker_includes: &'a [String], on_result: F) -> Self {
        Self {
            jobs,
            worker_includes,
            next_job: 0,
            results: BTreeMap::new(),
            on_result,
        }
    }

    fn is_complete(&self) -> bool {
        self.results.len() == self.jobs.len()
    }

    fn handle<O>(
        &mut self,
        message: &Message,
        connection: ConnectionId,
        outbox: &mut O,
    ) -> Result<()>
    where
        O: Outbox,
    {
        match Command::of(message)? {
            Command::NewWorker => {
                debug!("Worker registered on {:?}", connection);
                self.send_next_job(connection, outbox, true)
            }
            Command::JobResult => {
                let job_number = job_number(message)?;
                self.record_result(job_number, message.body())?;
                if self.is_complete() {
                    debug!("All {} results collected", self.jobs.len());
                    outbox.stop();
                    Ok(())
                } else {
                    self.send_next_job(connection, outbox, false)
                }
            }
        }
    }

    fn record_result(&mut self, job_number: usize, output: &[u8]) -> Result<()> {
        if job_number >= self.next_job {
            return Err(Error::UnknownJob(job_number));
        }
        if self.results.contains_key(&job_number) {
            return Err(Error::DuplicateResult(job_number));
        }
        (self.on_result)(job_number, output);
        self.results.insert(job_number, output.to_vec());
        Ok(())
    }

    /// Sends nothing if all jobs are out already. That worker stays idle until the loop stops.
    fn send_next_job<O>(
        &mut self,
        connection: ConnectionId,
        outbox: &mut O,
        first: bool,
    ) -> Result<()>
    where
        O: Outbox,
    {
        let job = match self.jobs.get(self.next_job) {
            Some(job) => job,
            None => return Ok(()),
        };

        let mut message = Message::new(job.payload.as_slice())
            .with_header(headers::JOB_NUM, self.next_job)
            .with_header(headers::FUNCTION, &job.function);
        if first && !self.worker_includes.is_empty() {
            message = message.with_header(headers::INCLUDES, self.worker_includes.join(","));
        }

        outbox.send(connection, &message)?;
        self.next_job += 1;
        Ok(())
    }

    /// Results ordered by job number
    fn into_results(self) -> Vec<Vec<u8>> {
        self.results.into_values().collect()
    }
}

fn unique_socket_path() -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    std::env::temp_dir().join(format!("jobmux_{}_{:x}.sock", process::id(), nanos))
}

/// Path of the listening socket, removed again when dropped
struct SocketFile(PathBuf);

impl SocketFile {
    /// Clears the way for binding to `path`
    fn bind_path(path: PathBuf) -> Result<Self> {
        match fs::remove_file(&path) {
            Ok(()) => debug!("Removed stale socket file {}", path.display()),
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(Self(path))
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for SocketFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records everything the dispatch state wants to send
    #[derive(Default)]
    struct RecordingOutbox {
        sent: Vec<(ConnectionId, Message)>,
        stopped: bool,
    }

    impl Outbox for RecordingOutbox {
        fn send(&mut self, connection: ConnectionId, message: &Message) -> Result<()> {
            if self.stopped {
                return Err(Error::Stopped);
            }
            self.sent.push((connection, message.clone()));
            Ok(())
        }

        fn stop(&mut self) {
            self.stopped = true;
        }
    }

    fn jobs(payloads: &[&str]) -> Vec<Job> {
        payloads
            .iter()
            .map(|payload| Job {
                function: "job_test".into(),
                payload: payload.as_bytes().to_vec(),
            })
            .collect()
    }

    fn new_worker() -> Message {
        Message::new("").with_header(headers::CMD, Command::NewWorker)
    }

    fn job_result(job_number: usize, output: &str) -> Message {
        Message::new(output)
            .with_header(headers::CMD, Command::JobResult)
            .with_header(headers::JOB_NUM, job_number)
    }

    // Connection ids are opaque outside of the event loop, the tests forge their own
    fn connection(n: usize) -> ConnectionId {
        ConnectionId::from_raw(n)
    }

    #[test]
    fn single_worker_gets_jobs_in_order() {
        let jobs = jobs(&["A", "B", "C"]);
        let includes: Vec<String> = Vec::new();
        let mut state = DispatchState::new(&jobs, &includes, |_, _| {});
        let mut outbox = RecordingOutbox::default();
        let worker = connection(0);

        state.handle(&new_worker(), worker, &mut outbox).unwrap();
        for job_number in 0..3 {
            let (to, job) = outbox.sent.last().unwrap().clone();
            assert_eq!(to, worker);
            assert_eq!(job.header(headers::JOB_NUM), Some(job_number.to_string().as_str()));
            assert_eq!(job.header(headers::FUNCTION), Some("job_test"));
            let output = format!("result({})", String::from_utf8_lossy(job.body()));
            state
                .handle(&job_result(job_number, &output), worker, &mut outbox)
                .unwrap();
        }

        assert!(outbox.stopped);
        assert_eq!(outbox.sent.len(), 3);
        assert_eq!(
            state.into_results(),
            vec![b"result(A)".to_vec(), b"result(B)".to_vec(), b"result(C)".to_vec()]
        );
    }

    #[test]
    fn results_are_ordered_by_job_number_for_any_completion_order() {
        let payloads = ["0", "1", "2", "3", "4"];
        let jobs = jobs(&payloads);
        let includes: Vec<String> = Vec::new();

        // Rotations and reversal of the completion order
        let mut orders = (0..payloads.len())
            .map(|shift| {
                (0..payloads.len())
                    .map(|i| (i + shift) % payloads.len())
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();
        orders.push((0..payloads.len()).rev().collect());

        for order in orders {
            let mut arrival = Vec::new();
            let mut state = DispatchState::new(&jobs, &includes, |n, _: &[u8]| arrival.push(n));
            let mut outbox = RecordingOutbox::default();

            // Five workers, one job each
            for worker in 0..payloads.len() {
                state.handle(&new_worker(), connection(worker), &mut outbox).unwrap();
            }
            for &job_number in &order {
                state
                    .handle(
                        &job_result(job_number, payloads[job_number]),
                        connection(job_number),
                        &mut outbox,
                    )
                    .unwrap();
            }

            assert!(outbox.stopped);
            let results = state.into_results();
            assert_eq!(
                results,
                payloads.iter().map(|p| p.as_bytes().to_vec()).collect::<Vec<_>>()
            );
            assert_eq!(arrival, order);
        }
    }

    #[test]
    fn surplus_worker_gets_nothing() {
        let jobs = jobs(&["only"]);
        let includes: Vec<String> = Vec::new();
        let mut state = DispatchState::new(&jobs, &includes, |_, _| {});
        let mut outbox = RecordingOutbox::default();

        state.handle(&new_worker(), connection(0), &mut outbox).unwrap();
        state.handle(&new_worker(), connection(1), &mut outbox).unwrap();
        assert_eq!(outbox.sent.len(), 1);
        assert_eq!(outbox.sent[0].0, connection(0));
    }

    #[test]
    fn includes_only_with_first_job_of_a_worker() {
        let jobs = jobs(&["a", "b", "c"]);
        let includes = vec!["lib/one".to_string(), "lib/two".to_string()];
        let mut state = DispatchState::new(&jobs, &includes, |_, _| {});
        let mut outbox = RecordingOutbox::default();

        state.handle(&new_worker(), connection(0), &mut outbox).unwrap();
        state.handle(&job_result(0, "x"), connection(0), &mut outbox).unwrap();
        state.handle(&new_worker(), connection(1), &mut outbox).unwrap();

        let includes = outbox
            .sent
            .iter()
            .map(|(_, m)| m.header(headers::INCLUDES))
            .collect::<Vec<_>>();
        assert_eq!(
            includes,
            vec![Some("lib/one,lib/two"), None, Some("lib/one,lib/two")]
        );
    }

    #[test]
    fn reject_result_for_undispatched_job() {
        let jobs = jobs(&["a", "b"]);
        let includes: Vec<String> = Vec::new();
        let mut state = DispatchState::new(&jobs, &includes, |_, _| {});
        let mut outbox = RecordingOutbox::default();

        state.handle(&new_worker(), connection(0), &mut outbox).unwrap();
        assert!(matches!(
            state.handle(&job_result(1, "x"), connection(0), &mut outbox),
            Err(Error::UnknownJob(1))
        ));
        assert!(matches!(
            state.handle(&job_result(99, "x"), connection(0), &mut outbox),
            Err(Error::UnknownJob(99))
        ));
    }

    #[test]
    fn reject_duplicate_result() {
        let jobs = jobs(&["a", "b", "c"]);
        let includes: Vec<String> = Vec::new();
        let mut state = DispatchState::new(&jobs, &includes, |_, _| {});
        let mut outbox = RecordingOutbox::default();

        state.handle(&new_worker(), connection(0), &mut outbox).unwrap();
        state.handle(&job_result(0, "x"), connection(0), &mut outbox).unwrap();
        assert!(matches!(
            state.handle(&job_result(0, "y"), connection(0), &mut outbox),
            Err(Error::DuplicateResult(0))
        ));
    }

    #[test]
    fn reject_messages_without_command() {
        let jobs = jobs(&["a"]);
        let includes: Vec<String> = Vec::new();
        let mut state = DispatchState::new(&jobs, &includes, |_, _| {});
        let mut outbox = RecordingOutbox::default();
        assert!(matches!(
            state.handle(&Message::new("x"), connection(0), &mut outbox),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn no_jobs_completes_immediately() {
        struct NoLaunch;
        impl WorkerLauncher for NoLaunch {
            type Handle = ();
            fn launch(&mut self, _: usize, _: &Path) -> io::Result<Vec<()>> {
                panic!("No worker must be launched for an empty batch");
            }
            fn terminate(&mut self, _: ()) {}
        }

        let mut server = Server::new(2, NoLaunch).unwrap();
        assert!(server.run().unwrap().is_empty());
    }

    #[test]
    fn reject_zero_workers() {
        struct NoLaunch;
        impl WorkerLauncher for NoLaunch {
            type Handle = ();
            fn launch(&mut self, _: usize, _: &Path) -> io::Result<Vec<()>> {
                Ok(Vec::new())
            }
            fn terminate(&mut self, _: ()) {}
        }

        assert!(matches!(
            Server::new(0, NoLaunch),
            Err(Error::InvalidWorkerCount)
        ));
    }
}
