use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use kubeprep::cli::{Cli, Commands};
use kubeprep::output::Output;
use kubeprep::runner::StreamingRunner;
use kubeprep::sysinfo::SystemInfo;
use kubeprep::{commands, CommandRunner};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run() {
        Output::error(format!("{err:#}"));
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let runner = StreamingRunner::new();

    // Detected once up front; every operation branches on the same facts.
    let info = SystemInfo::detect(&runner)?;

    dispatch(cli, &info, &runner)
}

fn dispatch(cli: Cli, info: &SystemInfo, runner: &dyn CommandRunner) -> Result<()> {
    match cli.command {
        Commands::System(args) => commands::system::run(args, info, runner),
        Commands::Container(args) => commands::container::run(args, info, runner),
        Commands::K8s(args) => commands::k8s::run(args, info, runner),
    }
}
