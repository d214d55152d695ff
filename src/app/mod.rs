use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use clap::Parser;
use nix::sys::signal::{Signal, kill};
use nix::unistd::{Group, Pid, User};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{self, Stdio};
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixListener};
use tokio::process::Command as TokioCommand;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

const EXIT_OK: i32 = 0;
const EXIT_RUNTIME: i32 = 1;
const EXIT_CONFIG: i32 = 2;

const DEFAULT_CONFIG_PATH: &str = "supd.toml";
const DEFAULT_START_DELAY_SECS: u64 = 1;
const DEFAULT_START_RETRIES: u32 = 10;

const UNIX_LISTEN_PREFIX: &str = "unix/:";
const CONTROL_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const CONTROL_LINE_MAX: usize = 64;

#[derive(Debug, Clone)]
enum CommandLine {
    Shell(String),
    Argv(Vec<String>),
}

#[derive(Debug, Clone)]
struct ChildSpec {
    name: String,
    cmd: CommandLine,
    start_delay: u64,
    start_retries: u32,
    stop_signal: Signal,
    reload_signal: Signal,
    umask: Option<u32>,
    uid: Option<u32>,
    gid: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ListenAddr {
    Tcp(String, u16),
    Unix(PathBuf),
}

#[derive(Debug, Clone)]
struct LogConfig {
    file: Option<PathBuf>,
    level: String,
}

#[derive(Debug, Clone)]
struct Config {
    children: Vec<ChildSpec>,
    listen: Option<ListenAddr>,
    umask: Option<u32>,
    log: LogConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChildAction {
    Start,
    Stop,
    Reload,
    Restart,
}

#[derive(Debug)]
enum ControlOp {
    Status,
    Child { action: ChildAction, name: String },
}

#[derive(Debug)]
enum ControlReply {
    Status(Vec<StatusRow>),
    Result(Option<usize>),
    UnknownChild,
}

#[derive(Debug, Clone)]
struct StatusRow {
    name: String,
    pid: Option<i32>,
    uptime_secs: i64,
    start_count: u32,
    broken: bool,
}

enum Event {
    Exited { name: String, r#gen: u64, raw: i32 },
    RestartDue { name: String, r#gen: u64 },
    Control { op: ControlOp, reply: oneshot::Sender<ControlReply> },
}

type EventTx = mpsc::UnboundedSender<Event>;

#[derive(Parser, Debug)]
#[command(
    name = "supd",
    about = "Multi-process supervisor with signal fan-out and a control socket",
    long_about = None
)]
#[command(version = "0.1.0")]
struct Cli {
    #[arg(value_name = "CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[arg(long)]
    check: bool,
}

mod cli;
mod config;
mod control;
mod engine;
mod ops;
mod supervisor;

pub fn entrypoint() {
    let cli = Cli::parse();
    process::exit(self::cli::run_cli(cli));
}
