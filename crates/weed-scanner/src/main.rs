use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use weed_scanner::{render_json, render_text, scan, ScanOptions};

#[derive(Parser, Debug)]
#[command(name = "weed-scanner", about = "List the Weed effect plugins a host would load")]
struct Args {
    /// Additional directories to scan
    #[arg(long = "path", value_name = "PATH")]
    paths: Vec<PathBuf>,

    /// Host settings file to take search paths and limits from
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Only scan the directories given with --path
    #[arg(long)]
    only: bool,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// Include filters hidden by a newer version
    #[arg(long)]
    all: bool,
}

impl Args {
    fn options(&self) -> ScanOptions {
        ScanOptions {
            config: self.config.clone(),
            extra_paths: self.paths.clone(),
            skip_default_paths: self.only,
            include_hidden: self.all,
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init()
        .ok();

    let args = Args::parse();
    let report = scan(&args.options())?;
    if args.json {
        println!("{}", render_json(&report)?);
    } else {
        print!("{}", render_text(&report));
    }
    Ok(())
}
