use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask", about = "Workspace automation for retrace")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// fmt, clippy and the full test suite
    Check,
    /// cargo fmt --check on all crates
    Fmt,
    /// clippy on all crates and targets, warnings denied
    Clippy,
    /// Run tests, optionally for one package
    Test {
        #[arg(short, long)]
        package: Option<String>,
    },
    /// Run only the cross-crate history scenarios
    Scenarios,
    /// Run the CLI walkthrough against an in-memory store
    Demo,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Check => {
            cargo("fmt", &["fmt", "--all", "--", "--check"])?;
            cargo(
                "clippy",
                &["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"],
            )?;
            cargo("test", &["test", "--workspace"])?;
        }
        Commands::Fmt => cargo("fmt", &["fmt", "--all", "--", "--check"])?,
        Commands::Clippy => cargo(
            "clippy",
            &["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"],
        )?,
        Commands::Test { package } => match package {
            Some(package) => cargo("test", &["test", "-p", &package])?,
            None => cargo("test", &["test", "--workspace"])?,
        },
        Commands::Scenarios => cargo(
            "scenarios",
            &["test", "-p", "retrace-timeline", "--test", "scenarios"],
        )?,
        Commands::Demo => cargo("demo", &["run", "-p", "retrace-cli", "--", "demo"])?,
    }

    Ok(())
}

fn cargo(task: &str, args: &[&str]) -> Result<()> {
    println!("==> cargo {}", args.join(" "));
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        anyhow::bail!("{task} failed");
    }
    Ok(())
}
