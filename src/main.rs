//! Look into UEFI firmware images
//!
//! Takes a full Intel flash image, a BIOS region, a capsule or a bare volume
//! and shows the structure found in it: regions, volumes, files and sections,
//! including whatever is hidden in compressed sections. Anything that does
//! not look right is reported along with the node it was found in.

use std::{fs, process::ExitCode};

use clap::{Args, Parser, Subcommand};
use log::{error, info};

mod show;

use ffs_parser::{FfsParser, ParseStatus, ParserConfig};

#[derive(Args, Debug)]
struct ParseArgs {
    /// Shortest run of 0x00/0xFF bytes classified as empty padding
    #[clap(long, default_value_t = 1)]
    min_uniform_run: usize,
    /// Deepest level at which nested volumes and sections are decoded
    #[clap(long, default_value_t = 64)]
    max_depth: usize,
    /// File to read
    file_name: String,
}

impl ParseArgs {
    fn config(&self) -> ParserConfig {
        ParserConfig {
            min_uniform_run: self.min_uniform_run,
            max_depth: self.max_depth,
            ..Default::default()
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Display the structure of an image along with diagnostics
    #[clap(verbatim_doc_comment)]
    Show(ParseArgs),
    /// Only print diagnostics; fails if there are any
    #[clap(verbatim_doc_comment)]
    Check(ParseArgs),
}

/// Parse UEFI firmware images
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Command to run
    #[command(subcommand)]
    cmd: Command,
    /// Print the details of every node
    #[clap(long, short, action, global = true)]
    verbose: bool,
}

fn parse(args: &ParseArgs) -> Option<FfsParser> {
    info!("Reading {}...", args.file_name);
    let data = match fs::read(&args.file_name) {
        Ok(d) => d,
        Err(e) => {
            error!("Could not read {}: {e}", args.file_name);
            return None;
        }
    };
    let mut parser = FfsParser::new(args.config());
    let status = parser.parse(&data);
    info!("{} bytes, {status}", data.len());
    if let ParseStatus::Fatal(m) = status {
        error!("{m}");
        return None;
    }
    Some(parser)
}

fn main() -> ExitCode {
    // Default to log level "info". Otherwise, you get no "regular" logs.
    let env = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(env).init();

    let Cli { cmd, verbose } = Cli::parse();
    match cmd {
        Command::Show(args) => {
            let Some(p) = parse(&args) else {
                return ExitCode::FAILURE;
            };
            show::show(&p, verbose);
            ExitCode::SUCCESS
        }
        Command::Check(args) => {
            let Some(p) = parse(&args) else {
                return ExitCode::FAILURE;
            };
            show::show_messages(&p);
            if p.messages().is_empty() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
    }
}
