use std::{
    ffi::OsString,
    io,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
};

use log::{debug, warn};

/// Starts worker processes that connect to the dispatcher's socket
pub trait WorkerLauncher {
    type Handle;

    fn launch(&mut self, count: usize, socket_path: &Path) -> io::Result<Vec<Self::Handle>>;

    /// Makes sure the worker is gone. Called for every handle after a run, successful or not.
    fn terminate(&mut self, handle: Self::Handle);
}

/// Spawns `program args... <socket path>` once per worker
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<OsString>,
    niceness: Option<i32>,
}

impl ProcessLauncher {
    pub fn new<P>(program: P) -> Self
    where
        P: Into<PathBuf>,
    {
        Self {
            program: program.into(),
            args: Vec::new(),
            niceness: None,
        }
    }

    pub fn arg<S>(mut self, arg: S) -> Self
    where
        S: Into<OsString>,
    {
        self.args.push(arg.into());
        self
    }

    /// Runs workers through `nice -n <niceness>`, so they don't starve regular processes on the
    /// same host
    pub fn niceness(mut self, niceness: i32) -> Self {
        self.niceness = Some(niceness);
        self
    }

    fn command(&self, socket_path: &Path) -> Command {
        let mut command = match self.niceness {
            Some(niceness) => {
                let mut command = Command::new("nice");
                command
                    .arg("-n")
                    .arg(niceness.to_string())
                    .arg(&self.program);
                command
            }
            None => Command::new(&self.program),
        };
        command
            .args(&self.args)
            .arg(socket_path)
            .stdin(Stdio::null())
            // Everything of interest travels over the socket
            .stdout(Stdio::null());
        command
    }
}

impl WorkerLauncher for ProcessLauncher {
    type Handle = Child;

    fn launch(&mut self, count: usize, socket_path: &Path) -> io::Result<Vec<Child>> {
        spawn_all(count, || self.command(socket_path).spawn())
    }

    fn terminate(&mut self, handle: Child) {
        reap(handle);
    }
}

/// Either all `count` children are running, or none is left behind
fn spawn_all<F>(count: usize, mut spawn: F) -> io::Result<Vec<Child>>
where
    F: FnMut() -> io::Result<Child>,
{
    let mut children = Vec::with_capacity(count);
    for _ in 0..count {
        match spawn() {
            Ok(child) => {
                debug!("Spawned worker process {}", child.id());
                children.push(child);
            }
            Err(e) => {
                warn!(
                    "Could not spawn worker process, stopping {} already running",
                    children.len()
                );
                children.into_iter().for_each(reap);
                return Err(e);
            }
        }
    }
    Ok(children)
}

fn reap(mut child: Child) {
    match child.try_wait() {
        Ok(Some(_)) => {}
        _ => {
            // Workers exit on their own once the dispatcher closes their connection, so this
            // normally only hits stuck processes
            debug!("Killing worker process {}", child.id());
            if let Err(e) = child.kill() {
                warn!("Could not kill worker process {}: {}", child.id(), e);
            }
            let _ = child.wait();
        }
    }
}
