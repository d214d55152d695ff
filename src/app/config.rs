use super::ops::*;
use super::*;

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawCommand {
    Shell(String),
    Argv(Vec<String>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawChild {
    Command(RawCommand),
    Record(RawChildRecord),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawChildRecord {
    cmd: Option<RawCommand>,
    start_delay: Option<u64>,
    start_retries: Option<u32>,
    stop_signal: Option<String>,
    reload_signal: Option<String>,
    umask: Option<String>,
    user: Option<String>,
    group: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    run: Option<BTreeMap<String, RawChild>>,
    #[serde(default)]
    global: RawGlobal,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawGlobal {
    listen: Option<String>,
    umask: Option<String>,
    #[serde(default)]
    log: RawLog,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLog {
    file: Option<PathBuf>,
    level: Option<String>,
}

pub(super) fn load_config(path: &Path) -> Result<Config> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    let parsed: RawConfig =
        toml::from_str(&raw).with_context(|| format!("parse config {}", path.display()))?;
    resolve(parsed)
}

fn resolve(raw: RawConfig) -> Result<Config> {
    let run = raw.run.ok_or_else(|| anyhow!("config has no [run] table"))?;
    if run.is_empty() {
        bail!("[run] table is empty");
    }

    let mut children = Vec::with_capacity(run.len());
    for (name, child) in run {
        children.push(resolve_child(name, child)?);
    }

    let listen = raw
        .global
        .listen
        .as_deref()
        .map(parse_listen)
        .transpose()
        .context("global.listen")?;
    let umask = raw
        .global
        .umask
        .as_deref()
        .map(parse_umask)
        .transpose()
        .context("global.umask")?;

    let level = raw.global.log.level.unwrap_or_else(|| "info".to_string());
    if !matches!(
        level.as_str(),
        "error" | "warn" | "info" | "debug" | "trace"
    ) {
        bail!("global.log.level '{level}' is not one of error/warn/info/debug/trace");
    }

    Ok(Config {
        children,
        listen,
        umask,
        log: LogConfig {
            file: raw.global.log.file,
            level,
        },
    })
}

fn resolve_child(name: String, raw: RawChild) -> Result<ChildSpec> {
    if !is_valid_name(&name) {
        bail!("invalid child name '{name}'");
    }

    let record = match raw {
        RawChild::Command(cmd) => RawChildRecord {
            cmd: Some(cmd),
            ..Default::default()
        },
        RawChild::Record(record) => record,
    };

    let cmd = match record.cmd {
        Some(RawCommand::Shell(s)) => {
            if s.trim().is_empty() {
                bail!("child '{name}' has an empty cmd");
            }
            CommandLine::Shell(s)
        }
        Some(RawCommand::Argv(argv)) => {
            if argv.is_empty() || argv[0].is_empty() {
                bail!("child '{name}' has an empty argv");
            }
            CommandLine::Argv(argv)
        }
        None => bail!("child '{name}' has no cmd"),
    };

    let stop_signal = parse_signal(record.stop_signal.as_deref().unwrap_or("TERM"))
        .with_context(|| format!("child '{name}': stop_signal"))?;
    let reload_signal = parse_signal(record.reload_signal.as_deref().unwrap_or("HUP"))
        .with_context(|| format!("child '{name}': reload_signal"))?;
    let umask = record
        .umask
        .as_deref()
        .map(parse_umask)
        .transpose()
        .with_context(|| format!("child '{name}': umask"))?;

    let uid = match record.user.as_deref() {
        Some(user) => Some(
            User::from_name(user)
                .with_context(|| format!("child '{name}': look up user '{user}'"))?
                .ok_or_else(|| anyhow!("child '{name}': unknown user '{user}'"))?
                .uid
                .as_raw(),
        ),
        None => None,
    };
    let gid = match record.group.as_deref() {
        Some(group) => Some(
            Group::from_name(group)
                .with_context(|| format!("child '{name}': look up group '{group}'"))?
                .ok_or_else(|| anyhow!("child '{name}': unknown group '{group}'"))?
                .gid
                .as_raw(),
        ),
        None => None,
    };

    Ok(ChildSpec {
        name,
        cmd,
        start_delay: record.start_delay.unwrap_or(DEFAULT_START_DELAY_SECS),
        start_retries: record.start_retries.unwrap_or(DEFAULT_START_RETRIES),
        stop_signal,
        reload_signal,
        umask,
        uid,
        gid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve_str(raw: &str) -> Result<Config> {
        resolve(toml::from_str::<RawConfig>(raw).expect("toml"))
    }

    #[test]
    fn string_child_gets_defaults() {
        let cfg = resolve_str("[run]\nweb = \"sleep 5\"\n").unwrap();
        assert_eq!(cfg.children.len(), 1);
        let c = &cfg.children[0];
        assert_eq!(c.name, "web");
        assert!(matches!(&c.cmd, CommandLine::Shell(s) if s == "sleep 5"));
        assert_eq!(c.start_delay, 1);
        assert_eq!(c.start_retries, 10);
        assert_eq!(c.stop_signal, Signal::SIGTERM);
        assert_eq!(c.reload_signal, Signal::SIGHUP);
        assert!(c.umask.is_none());
        assert!(c.uid.is_none() && c.gid.is_none());
    }

    #[test]
    fn argv_child_is_accepted() {
        let cfg = resolve_str("[run]\nweb = [\"sleep\", \"5\"]\n").unwrap();
        assert!(matches!(
            &cfg.children[0].cmd,
            CommandLine::Argv(argv) if argv == &["sleep", "5"]
        ));
    }

    #[test]
    fn record_child_overrides_defaults() {
        let cfg = resolve_str(
            r#"
[run.worker]
cmd = ["/bin/false"]
start_delay = 0
start_retries = 3
stop_signal = "USR2"
reload_signal = "SIGUSR1"
umask = "077"
"#,
        )
        .unwrap();
        let c = &cfg.children[0];
        assert_eq!(c.start_delay, 0);
        assert_eq!(c.start_retries, 3);
        assert_eq!(c.stop_signal, Signal::SIGUSR2);
        assert_eq!(c.reload_signal, Signal::SIGUSR1);
        assert_eq!(c.umask, Some(0o077));
    }

    #[test]
    fn children_come_out_sorted_by_name() {
        let cfg = resolve_str("[run]\nb = \"x\"\na = \"y\"\nc = \"z\"\n").unwrap();
        let names: Vec<&str> = cfg.children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    fn missing_run_table_is_rejected() {
        let err = resolve_str("").unwrap_err();
        assert!(err.to_string().contains("no [run]"));
    }

    #[test]
    fn empty_run_table_is_rejected() {
        let err = resolve_str("[run]\n").unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn child_without_cmd_is_rejected() {
        let err = resolve_str("[run.web]\nstart_delay = 2\n").unwrap_err();
        assert!(err.to_string().contains("no cmd"));
    }

    #[test]
    fn empty_argv_is_rejected() {
        assert!(resolve_str("[run]\nweb = []\n").is_err());
        assert!(resolve_str("[run]\nweb = \"  \"\n").is_err());
    }

    #[test]
    fn bad_signal_name_is_rejected() {
        let err = resolve_str("[run.web]\ncmd = \"x\"\nstop_signal = \"NOPE\"\n").unwrap_err();
        assert!(format!("{err:#}").contains("stop_signal"));
    }

    #[test]
    fn bad_log_level_is_rejected() {
        let err = resolve_str("[run]\nw = \"x\"\n[global.log]\nlevel = \"loud\"\n").unwrap_err();
        assert!(err.to_string().contains("log.level"));
    }

    #[test]
    fn global_listen_and_umask_are_parsed() {
        let cfg = resolve_str(
            "[run]\nw = \"x\"\n[global]\nlisten = \"127.0.0.1:4440\"\numask = \"022\"\n",
        )
        .unwrap();
        assert_eq!(
            cfg.listen,
            Some(ListenAddr::Tcp("127.0.0.1".to_string(), 4440))
        );
        assert_eq!(cfg.umask, Some(0o022));
    }

    #[test]
    fn invalid_child_name_is_rejected() {
        let err = resolve_str("[run]\n\"bad name\" = \"x\"\n").unwrap_err();
        assert!(err.to_string().contains("invalid child name"));
    }
}
