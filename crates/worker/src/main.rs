use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;

use clap::Parser;
use sign_worker::{Worker, signer};

#[derive(Parser)]
#[command(name = "sign-worker", version, about = "One-shot PDF signing worker")]
struct Args {
    /// Working directory prepared by the agent.
    work_dir: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if !args.work_dir.is_dir() {
        eprintln!("working directory does not exist: {}", args.work_dir.display());
        return ExitCode::FAILURE;
    }

    // Log to a file inside the working directory so the agent can collect
    // it alongside the run's other artifacts.
    let log_path = args.work_dir.join(sign_protocol::WORKER_LOG_FILE);
    match std::fs::File::create(&log_path) {
        Ok(file) => {
            tracing_subscriber::fmt()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        Err(e) => {
            eprintln!("cannot create {}: {e}", log_path.display());
        }
    }

    let worker = Worker::new(&args.work_dir);
    let code = worker.run(&signer::open_backend);

    if code == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
