//! Purpose: `msglog` CLI entry point.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Commands emit JSON on stdout, except `dump` which prints text.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: All file access goes through `api::LogStore` (lock + mutex).
#![allow(clippy::result_large_err)]
use std::io::{self, IsTerminal};
use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand, ValueHint, error::ErrorKind as ClapErrorKind};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};
use std::error::Error as StdError;
use tracing_subscriber::EnvFilter;

mod command_dispatch;
mod record_json;

use command_dispatch::dispatch_command;
use msglog::api::{Error, ErrorKind, to_exit_code};

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    init_tracing();
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint(clap_error_hint(&err)));
            }
        },
    };

    dispatch_command(cli.command)
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

#[derive(Parser)]
#[command(
    name = "msglog",
    version,
    about = "Compact binary log files with interned strings",
    long_about = None,
    before_help = r#"A log file has a fixed size. It holds an index of records, a table of
repeated strings, and the records themselves. When it fills up it is renamed
with a timestamp suffix and a fresh file takes its place."#,
    after_help = r#"EXAMPLES
  $ msglog create app.mlog --size 1M
  $ msglog write app.mlog "service started" --app gateway --file main.rs --line 12
  $ msglog list app.mlog --jsonl
  $ msglog get app.mlog 1
  $ msglog dump app.mlog

  Set RUST_LOG=info (or debug) to see store activity on stderr."#,
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(
        about = "Create (or replace) a log file",
        long_about = r#"Create a log file sized to --size bytes.

Index and string-table capacities are derived from the size unless given
explicitly."#,
        after_help = r#"EXAMPLES
  $ msglog create app.mlog --size 4M
  $ msglog create app.mlog --size 64K --max-entries 100 --force"#
    )]
    Create {
        #[arg(help = "Log file path", value_hint = ValueHint::FilePath)]
        path: PathBuf,
        #[arg(long, default_value = "1M", help = "File size (bytes or K/M/G)")]
        size: String,
        #[arg(long, help = "Index capacity (records per file)")]
        max_entries: Option<u32>,
        #[arg(long, help = "String table size (bytes or K/M/G)")]
        string_table_size: Option<String>,
        #[arg(long, help = "String table capacity (distinct strings)")]
        max_strings: Option<u32>,
        #[arg(long, help = "Replace an existing file")]
        force: bool,
    },
    #[command(about = "Show geometry and usage of a log file")]
    Info {
        #[arg(help = "Log file path", value_hint = ValueHint::FilePath)]
        path: PathBuf,
    },
    #[command(
        about = "Append one message",
        long_about = r#"Append one message to a log file.

Without --id the message gets the newest id plus one. Rotation happens
automatically when the file is full; the archive path is reported."#,
        after_help = r#"EXAMPLES
  $ msglog write app.mlog "disk almost full" --app monitor --machine db-1 --channel 3
  $ msglog write app.mlog "tick" --create --size 64K --reuse"#
    )]
    Write {
        #[arg(help = "Log file path", value_hint = ValueHint::FilePath)]
        path: PathBuf,
        #[arg(help = "Message text")]
        msg: String,
        #[arg(long, help = "Message id (default: newest id + 1)")]
        id: Option<u32>,
        #[arg(long, default_value = "", help = "Source file name")]
        file: String,
        #[arg(long, default_value_t = 0, help = "Source line number")]
        line: u32,
        #[arg(long, default_value = "", help = "Application name")]
        app: String,
        #[arg(long, default_value = "", help = "Machine name")]
        machine: String,
        #[arg(long, default_value_t = 0, help = "Channel number")]
        channel: u32,
        #[arg(long, default_value_t = 0, help = "Thread id")]
        thread: u32,
        #[arg(long, help = "Evict the oldest records instead of rotating")]
        reuse: bool,
        #[arg(long, help = "Create the file if it is missing")]
        create: bool,
        #[arg(long, default_value = "1M", help = "Size used with --create")]
        size: String,
    },
    #[command(about = "Fetch one message by id")]
    Get {
        #[arg(help = "Log file path", value_hint = ValueHint::FilePath)]
        path: PathBuf,
        #[arg(help = "Message id")]
        id: u32,
    },
    #[command(about = "List all readable messages, oldest first")]
    List {
        #[arg(help = "Log file path", value_hint = ValueHint::FilePath)]
        path: PathBuf,
        #[arg(long, help = "Emit JSON Lines (one message per line)")]
        jsonl: bool,
    },
    #[command(about = "Print headers, string table, index, and messages as text")]
    Dump {
        #[arg(help = "Log file path", value_hint = ValueHint::FilePath)]
        path: PathBuf,
    },
    #[command(about = "Archive the current file and start a fresh one")]
    Rotate {
        #[arg(help = "Log file path", value_hint = ValueHint::FilePath)]
        path: PathBuf,
    },
    #[command(
        about = "Rebuild the index by scanning for records",
        long_about = r#"Rebuild the index directory and string table of a damaged file.

The message area is scanned for record markers; every record that decodes
is kept (newest wins on duplicate ids) up to the index capacity."#
    )]
    Recover {
        #[arg(help = "Log file path", value_hint = ValueHint::FilePath)]
        path: PathBuf,
    },
    #[command(
        arg_required_else_help = true,
        about = "Generate shell completions",
        after_help = r#"EXAMPLES
  $ msglog completion bash > ~/.local/share/bash-completion/completions/msglog
  $ msglog completion zsh > ~/.zfunc/_msglog
  $ msglog completion fish > ~/.config/fish/completions/msglog.fish"#
    )]
    Completion {
        #[arg(help = "Shell to generate completions for")]
        shell: Shell,
    },
}

fn parse_size(input: &str) -> Result<u64, Error> {
    let trimmed = input.trim();
    let split = trimmed
        .char_indices()
        .find(|(_, ch)| !ch.is_ascii_digit())
        .map(|(idx, _)| idx)
        .unwrap_or(trimmed.len());
    let digits = trimmed[..split].trim();
    let suffix = trimmed[split..].trim();

    let value: u64 = digits.parse().map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid size")
            .with_hint("Use bytes or K/M/G (e.g. 4M).")
            .with_source(err)
    })?;

    let multiplier = match suffix {
        "" => 1,
        "K" | "k" => 1024,
        "M" | "m" => 1024 * 1024,
        "G" | "g" => 1024 * 1024 * 1024,
        _ => {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("invalid size suffix")
                .with_hint("Use K/M/G (e.g. 4M)."));
        }
    };

    value.checked_mul(multiplier).ok_or_else(|| {
        Error::new(ErrorKind::Usage)
            .with_message("size overflow")
            .with_hint("Use a smaller size value.")
    })
}

fn emit_json(value: Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }

    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::NotFound => "not found".to_string(),
        ErrorKind::Busy => "log file is busy".to_string(),
        ErrorKind::Permission => "permission denied".to_string(),
        ErrorKind::Format => "not a message log".to_string(),
        ErrorKind::Capacity => "does not fit".to_string(),
        ErrorKind::Corrupt => "corrupt data".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(id) = err.id() {
        inner.insert("id".to_string(), json!(id));
    }
    if let Some(offset) = err.offset() {
        inner.insert("offset".to_string(), json!(offset));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if let Some(hint) = err.hint() {
        lines.push(format!("hint: {hint}"));
    }
    if let Some(path) = err.path() {
        lines.push(format!("path: {}", path.display()));
    }
    if let Some(id) = err.id() {
        lines.push(format!("id: {id}"));
    }
    if let Some(offset) = err.offset() {
        lines.push(format!("offset: {offset}"));
    }
    if let Some(cause) = error_causes(err).first() {
        lines.push(format!("caused by: {cause}"));
    }
    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

fn clap_error_hint(err: &clap::Error) -> String {
    let rendered = err.to_string();
    let usage = rendered
        .lines()
        .find_map(|line| line.trim().strip_prefix("Usage: "))
        .map(str::trim);
    let Some(usage) = usage else {
        return "Try `msglog --help`.".to_string();
    };
    let tokens: Vec<&str> = usage.split_whitespace().collect();
    let Some(pos) = tokens.iter().position(|t| *t == "msglog") else {
        return "Try `msglog --help`.".to_string();
    };
    let parts: Vec<&str> = tokens
        .iter()
        .skip(pos + 1)
        .take_while(|token| {
            !(token.starts_with('-') || token.starts_with('<') || token.starts_with('['))
        })
        .copied()
        .collect();
    if parts.is_empty() {
        return "Try `msglog --help`.".to_string();
    }
    format!("Try `msglog {} --help`.", parts.join(" "))
}
