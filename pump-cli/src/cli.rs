use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "pump",
    author,
    version,
    about = "Run event pipelines declared in a TOML file"
)]
pub struct Args {
    /// Pipeline definition file
    #[arg(short, long, env = "PUMP_CONFIG", default_value = "pump.toml")]
    pub config: PathBuf,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, conflicts_with = "quiet")]
    pub verbose: u8,

    /// Only log errors
    #[arg(short, long)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Build and run every pipeline until Ctrl-C or a run-once trigger completes
    Run,

    /// Build every pipeline and print its layout without running it
    Check,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_is_the_default_command() {
        let args = Args::parse_from(["pump", "-c", "demo.toml", "-vv"]);
        assert_eq!(args.config, PathBuf::from("demo.toml"));
        assert_eq!(args.verbose, 2);
        assert!(args.command.is_none());

        let args = Args::parse_from(["pump", "-q", "check"]);
        assert!(args.quiet);
        assert_eq!(args.command, Some(Commands::Check));
    }
}
