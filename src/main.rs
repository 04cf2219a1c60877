use std::{
    env,
    io::{self, BufRead, Write},
    path::PathBuf,
    time::{Duration, Instant},
};

use anyhow::{bail, Context, Result};
use clap::{crate_authors, crate_description, crate_version, value_parser, Arg, ArgAction, Command};
use log::{debug, info};

use jobmux::{
    FunctionRegistry, JobExecutor, LoopOptions, ProcessLauncher, Server, ServerOptions, Worker,
    WorkerOptions, CRATE_NAME,
};

fn main() -> Result<()> {
    let registry = builtin_functions();
    let mut function_names = registry.names().collect::<Vec<_>>();
    function_names.sort_unstable();
    let function_names = function_names.join(", ");

    let matches = Command::new(CRATE_NAME)
        .about(crate_description!())
        .version(crate_version!())
        .author(crate_authors!())
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("v")
                .short('v')
                .global(true)
                .action(ArgAction::Count)
                .help("Sets the level of verbosity"),
        )
        .subcommand(
            Command::new("run")
                .about("Runs every payload (or every line of stdin) as one job")
                .arg(
                    Arg::new("workers")
                        .short('w')
                        .long("workers")
                        .default_value("3")
                        .value_parser(value_parser!(usize))
                        .help("Number of worker processes"),
                )
                .arg(
                    Arg::new("function")
                        .short('f')
                        .long("function")
                        .default_value("echo")
                        .help(format!("Built-in job function: {}", function_names)),
                )
                .arg(
                    Arg::new("timeout")
                        .long("timeout")
                        .default_value("60")
                        .value_parser(value_parser!(u64))
                        .help("Seconds without any worker activity before giving up"),
                )
                .arg(
                    Arg::new("payloads")
                        .num_args(0..)
                        .value_name("PAYLOAD")
                        .help("Job payloads. Read from stdin, one per line, if omitted."),
                ),
        )
        .subcommand(
            Command::new("worker")
                .about("Worker process entry point, started by `run`")
                .arg(
                    Arg::new("timeout")
                        .long("timeout")
                        .default_value("60")
                        .value_parser(value_parser!(u64))
                        .help("Seconds to wait for the next job before giving up"),
                )
                .arg(
                    Arg::new("socket")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .value_name("SOCKET"),
                ),
        )
        .get_matches();

    simple_logger::SimpleLogger::new()
        .with_level(match matches.get_count("v") {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        })
        .init()?;

    match matches.subcommand() {
        Some(("run", run_matches)) => {
            let workers = *run_matches
                .get_one::<usize>("workers")
                .expect("argument has a default value");
            let function = run_matches
                .get_one::<String>("function")
                .expect("argument has a default value");
            let timeout = *run_matches
                .get_one::<u64>("timeout")
                .expect("argument has a default value");
            let payloads = match run_matches.get_many::<String>("payloads") {
                Some(payloads) => payloads.cloned().collect(),
                None => io::stdin()
                    .lock()
                    .lines()
                    .collect::<io::Result<Vec<_>>>()
                    .context("Could not read payloads from stdin")?,
            };
            run(workers, function, timeout, payloads)
        }
        Some(("worker", worker_matches)) => {
            let socket = worker_matches
                .get_one::<PathBuf>("socket")
                .expect("argument is required");
            let timeout = *worker_matches
                .get_one::<u64>("timeout")
                .expect("argument has a default value");
            let options = WorkerOptions {
                read_timeout: Some(Duration::from_secs(timeout)),
                ..WorkerOptions::default()
            };
            debug!("Worker {} connecting to {}", std::process::id(), socket.display());
            Worker::connect(socket, builtin_functions(), options)?.run()?;
            Ok(())
        }
        _ => unreachable!(),
    }
}

fn run(workers: usize, function: &str, timeout: u64, payloads: Vec<String>) -> Result<()> {
    if builtin_functions().resolve(function).is_none() {
        bail!("Unknown function {:?}", function);
    }

    // Workers may sit idle for as long as the dispatcher waits for any activity
    let launcher = ProcessLauncher::new(env::current_exe()?)
        .arg("worker")
        .arg("--timeout")
        .arg(timeout.to_string());
    let options = ServerOptions {
        loop_options: LoopOptions {
            idle_timeout: Duration::from_secs(timeout),
            ..LoopOptions::default()
        },
        socket_path: None,
    };
    let mut server = Server::with_options(workers, launcher, options)?;
    for payload in payloads {
        server.submit(function, payload);
    }

    let start = Instant::now();
    let num_jobs = server.num_jobs();
    let results = server
        .run_with(|job_number, _| debug!("Job {} finished", job_number))
        .context("Could not finish the batch")?;
    info!("Finished {} jobs in {:?}", num_jobs, start.elapsed());

    let stdout = io::stdout();
    let mut stdout = stdout.lock();
    for result in results {
        stdout.write_all(&result)?;
        stdout.write_all(b"\n")?;
    }
    Ok(())
}

fn builtin_functions() -> FunctionRegistry {
    FunctionRegistry::new()
        .register("echo", |input| input.to_vec())
        .register("reverse", |input| input.iter().rev().copied().collect())
        .register("uppercase", |input| input.to_ascii_uppercase())
        .register("length", |input| input.len().to_string().into_bytes())
}
