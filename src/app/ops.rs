use super::*;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

pub(super) fn parse_signal(input: &str) -> Result<Signal> {
    let upper = input.trim().to_ascii_uppercase();
    if upper.is_empty() {
        bail!("empty signal name");
    }
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::from_str(&full).map_err(|_| anyhow!("unknown signal '{input}'"))
}

pub(super) fn parse_umask(input: &str) -> Result<u32> {
    let mask = u32::from_str_radix(input, 8)
        .with_context(|| format!("invalid umask '{input}', expected octal digits"))?;
    if mask > 0o777 {
        bail!("umask '{input}' out of range");
    }
    Ok(mask)
}

pub(super) fn parse_listen(input: &str) -> Result<ListenAddr> {
    if let Some(path) = input.strip_prefix(UNIX_LISTEN_PREFIX) {
        if path.is_empty() {
            bail!("listen '{input}' has an empty socket path");
        }
        return Ok(ListenAddr::Unix(PathBuf::from(path)));
    }
    let (host, port) = input
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("listen '{input}' is not host:port or unix/:path"))?;
    if host.is_empty() {
        bail!("listen '{input}' has an empty host");
    }
    let port = port
        .parse::<u16>()
        .with_context(|| format!("invalid listen port '{port}'"))?;
    Ok(ListenAddr::Tcp(host.to_string(), port))
}

pub(super) fn is_valid_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > 64 {
        return false;
    }
    let first = bytes[0] as char;
    if !first.is_ascii_alphanumeric() {
        return false;
    }
    bytes.iter().all(|b| {
        let c = *b as char;
        c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-'
    })
}

pub(super) fn format_status_row(row: &StatusRow) -> String {
    if let Some(pid) = row.pid {
        format!("{} up {} {}", row.name, row.uptime_secs, pid)
    } else if row.broken {
        format!("{} fail {}", row.name, row.start_count)
    } else {
        format!("{} down", row.name)
    }
}

pub(super) fn log_directives(level: &str, debug_forced: bool) -> String {
    if debug_forced {
        "trace".to_string()
    } else {
        level.to_string()
    }
}

pub(super) fn sv_debug_forced() -> bool {
    std::env::var_os("SV_DEBUG").is_some_and(|v| !v.is_empty())
}

pub(super) fn init_logging(log: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_new(log_directives(&log.level, sv_debug_forced()))
        .map_err(|e| anyhow!("bad log filter: {e}"))?;
    match &log.file {
        Some(path) => {
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(io::stderr)
                .init();
        }
    }
    Ok(())
}
