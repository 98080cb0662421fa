//! CLI dispatch for user binaries.
//!
//! A user's `main.rs` declares the pipeline and hands it to [`run`],
//! which exposes the four invocations: `build` (the default), `watch`,
//! `local` and `tunnel`.

use clap::{Parser, Subcommand};

use crate::pipeline::Pipeline;
use crate::serve::ServeOptions;

#[derive(Debug, Parser)]
#[command(version, about = "Build, watch and serve a static asset pipeline", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, Copy, Subcommand)]
pub enum Command {
    /// Run every task once and exit. Exits non-zero if any task failed.
    Build,
    /// Build, then rebuild on file changes until interrupted.
    Watch,
    /// Serve the output directory locally with live reload.
    Local,
    /// Serve with a public tunnel for remote preview.
    Tunnel,
}

pub fn run(pipeline: &Pipeline) -> anyhow::Result<()> {
    let cli = Cli::parse();
    dispatch(pipeline, cli.command.unwrap_or(Command::Build))
}

pub fn dispatch(pipeline: &Pipeline, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Build => {
            let report = pipeline.build()?;

            if !report.is_success() {
                let failed = report.failures().count();
                anyhow::bail!("{failed} task(s) failed");
            }

            Ok(())
        }
        Command::Watch => Ok(pipeline.watch()?),
        Command::Local => Ok(pipeline.serve(ServeOptions::default())?),
        Command::Tunnel => Ok(pipeline.serve(ServeOptions {
            tunnel: true,
            ..Default::default()
        })?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_declaration_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn default_invocation_is_build() {
        let cli = Cli::try_parse_from(["bellows"]).unwrap();
        assert!(cli.command.is_none());

        let cli = Cli::try_parse_from(["bellows", "tunnel"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Tunnel)));
    }
}
