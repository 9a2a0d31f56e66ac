use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use vision::{
    PipelineConfig, RunArgs, TelemetryOptions,
    perf::{self, Milestone, ProbeContext},
    pipeline::telemetry,
};

use crate::lifecycle;

#[derive(Debug, Parser)]
#[command(name = "detect-app", version, about = "Live object detection over a camera feed")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the capture and detection pipeline.
    Run(RunArgs),
    /// Sample memory and storage once and exit.
    Probe(ProbeArgs),
}

#[derive(Debug, Args)]
struct ProbeArgs {
    /// Directory sampled for app storage figures.
    #[arg(long = "data-dir", value_name = "PATH", default_value = ".")]
    data_dir: PathBuf,
    /// Print the sample as JSON instead of log lines.
    #[arg(long = "json", action = clap::ArgAction::SetTrue)]
    json: bool,
}

pub fn handle_commands() -> Result<()> {
    match Cli::parse().command {
        Command::Run(args) => {
            let config = PipelineConfig::try_from(args)?;
            lifecycle::run(config)
        }
        Command::Probe(args) => probe(args),
    }
}

fn probe(args: ProbeArgs) -> Result<()> {
    let mut ctx = ProbeContext::new(args.data_dir);
    if args.json {
        let snapshot = perf::sample(&mut ctx);
        let text =
            serde_json::to_string_pretty(&snapshot).context("failed to serialise sample")?;
        println!("{text}");
        return Ok(());
    }

    let _telemetry = telemetry::enter_runtime(&TelemetryOptions::default());
    perf::log_all(&mut ctx, Milestone::OnDemand);
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_subcommands() {
        let cli = Cli::try_parse_from(["detect-app", "probe", "--json"]).expect("probe parses");
        assert!(matches!(cli.command, Command::Probe(ProbeArgs { json: true, .. })));

        let cli = Cli::try_parse_from(["detect-app", "run", "--rotation", "180", "--no-perf"])
            .expect("run parses");
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        let config = PipelineConfig::try_from(args).expect("valid config");
        assert!(!config.perf.enabled);
    }
}
