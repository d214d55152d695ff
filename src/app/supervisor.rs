use super::*;

pub(super) struct Child {
    spec: ChildSpec,
    events: EventTx,
    pid: Option<i32>,
    r#gen: u64,
    start_count: u32,
    start_ts: Option<DateTime<Utc>>,
    started: Option<Instant>,
    last_status: Option<i32>,
    broken: bool,
}

impl Child {
    pub(super) fn new(spec: ChildSpec, events: EventTx) -> Self {
        Self {
            spec,
            events,
            pid: None,
            r#gen: 0,
            start_count: 0,
            start_ts: None,
            started: None,
            last_status: None,
            broken: false,
        }
    }

    pub(super) fn is_alive(&self) -> bool {
        self.pid.is_some()
    }

    pub(super) fn start(&mut self) -> Option<usize> {
        if self.pid.is_some() {
            return None;
        }
        if self.broken {
            // An explicit start grants a fresh batch of retries.
            self.broken = false;
            self.start_count = 0;
        }
        self.r#gen += 1;
        if self.start_attempt() { Some(1) } else { None }
    }

    fn start_attempt(&mut self) -> bool {
        self.start_count = self.start_count.saturating_add(1);
        match spawn_child(&self.spec, self.r#gen, &self.events) {
            Ok(pid) => {
                info!(
                    "started '{}' pid {} (attempt {})",
                    self.spec.name, pid, self.start_count
                );
                self.pid = Some(pid);
                self.start_ts = Some(Utc::now());
                self.started = Some(Instant::now());
                true
            }
            Err(e) => {
                warn!("spawn '{}' failed: {e:#}", self.spec.name);
                self.apply_restart_policy();
                false
            }
        }
    }

    pub(super) fn stop(&mut self) -> Option<usize> {
        if self.pid.is_none() {
            // Nothing to signal, but an operator stop still invalidates a
            // pending restart timer.
            self.r#gen += 1;
            return None;
        }
        let n = self.send_signal(self.spec.stop_signal)?;
        // Operator intent overrides the automatic restart: bumping the
        // generation makes the pending exit event stale.
        self.r#gen += 1;
        self.pid = None;
        self.start_count = 0;
        info!("stopped '{}'", self.spec.name);
        Some(n)
    }

    pub(super) fn reload(&self) -> Option<usize> {
        self.send_signal(self.spec.reload_signal)
    }

    pub(super) fn restart(&self) -> Option<usize> {
        // State stays untouched; the exit event drives the restart.
        self.send_signal(self.spec.stop_signal)
    }

    pub(super) fn send_signal(&self, sig: Signal) -> Option<usize> {
        let pid = self.pid?;
        match kill(Pid::from_raw(pid), sig) {
            Ok(()) => Some(1),
            Err(e) => {
                debug!("kill {} '{}' pid {pid} failed: {e}", sig.as_str(), self.spec.name);
                None
            }
        }
    }

    pub(super) fn handle_exit(&mut self, r#gen: u64, raw: i32) {
        if r#gen != self.r#gen {
            return;
        }
        let Some(pid) = self.pid.take() else { return };
        self.last_status = Some((raw >> 8) & 0xff);
        info!(
            "'{}' pid {pid} exited with status {}",
            self.spec.name,
            self.last_status.unwrap_or_default()
        );
        // With start_delay = 0 a sub-second run still counts as a failed
        // start; anything that lived a whole second does not.
        let stable = self.started.is_some_and(|t| {
            let elapsed = t.elapsed();
            if self.spec.start_delay == 0 {
                elapsed.as_secs() > 0
            } else {
                elapsed > Duration::from_secs(self.spec.start_delay)
            }
        });
        if stable {
            self.start_count = 0;
        }
        self.apply_restart_policy();
    }

    pub(super) fn handle_restart_due(&mut self, r#gen: u64) {
        if r#gen != self.r#gen || self.pid.is_some() || self.broken {
            return;
        }
        self.start_attempt();
    }

    fn apply_restart_policy(&mut self) {
        if self.spec.start_retries > 0 && self.start_count >= self.spec.start_retries {
            warn!(
                "giving up on '{}' after {} failed starts",
                self.spec.name, self.start_count
            );
            self.broken = true;
            return;
        }
        self.schedule_restart();
    }

    fn schedule_restart(&self) {
        let events = self.events.clone();
        let name = self.spec.name.clone();
        let r#gen = self.r#gen;
        let delay = Duration::from_secs(self.spec.start_delay);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(Event::RestartDue { name, r#gen });
        });
    }

    pub(super) fn status_row(&self) -> StatusRow {
        StatusRow {
            name: self.spec.name.clone(),
            pid: self.pid,
            uptime_secs: self
                .start_ts
                .map_or(0, |ts| (Utc::now() - ts).num_seconds().max(0)),
            start_count: self.start_count,
            broken: self.broken,
        }
    }
}

fn spawn_child(spec: &ChildSpec, r#gen: u64, events: &EventTx) -> Result<i32> {
    let mut cmd = match &spec.cmd {
        CommandLine::Shell(line) => {
            let mut cmd = TokioCommand::new("/bin/sh");
            cmd.arg("-c").arg(line);
            cmd
        }
        CommandLine::Argv(argv) => {
            let mut cmd = TokioCommand::new(&argv[0]);
            cmd.args(&argv[1..]);
            cmd
        }
    };
    cmd.stdin(Stdio::null());

    let uid = spec.uid;
    let gid = spec.gid;
    let mask = spec.umask;
    unsafe {
        cmd.pre_exec(move || {
            // gid first; after setuid we may no longer be allowed to.
            if let Some(gid) = gid
                && nix::libc::setgid(gid) != 0
            {
                return Err(io::Error::last_os_error());
            }
            if let Some(uid) = uid
                && nix::libc::setuid(uid) != 0
            {
                return Err(io::Error::last_os_error());
            }
            if let Some(mask) = mask {
                nix::libc::umask(mask as nix::libc::mode_t);
            }
            Ok(())
        });
    }

    let mut child = cmd.spawn()?;
    let pid = child
        .id()
        .map(|p| p as i32)
        .ok_or_else(|| anyhow!("spawned child has no pid"))?;

    let name = spec.name.clone();
    let events = events.clone();
    tokio::spawn(async move {
        let raw = match child.wait().await {
            Ok(status) => status.into_raw(),
            Err(e) => {
                warn!("wait for '{name}' failed: {e}");
                0xff00
            }
        };
        let _ = events.send(Event::Exited { name, r#gen, raw });
    });

    Ok(pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, start_delay: u64, start_retries: u32) -> ChildSpec {
        ChildSpec {
            name: name.to_string(),
            cmd: CommandLine::Shell("true".to_string()),
            start_delay,
            start_retries,
            stop_signal: Signal::SIGTERM,
            reload_signal: Signal::SIGHUP,
            umask: None,
            uid: None,
            gid: None,
        }
    }

    #[tokio::test]
    async fn start_spawns_and_the_watcher_reports_exit() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut child = Child::new(spec("t", 1, 10), tx);

        assert_eq!(child.start(), Some(1));
        assert!(child.is_alive());
        assert_eq!(child.start_count, 1);
        assert!(child.start().is_none());

        let ev = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("exit within 5s")
            .expect("channel open");
        match ev {
            Event::Exited { name, r#gen, raw } => {
                assert_eq!(name, "t");
                assert_eq!(r#gen, 1);
                assert_eq!((raw >> 8) & 0xff, 0);
            }
            _ => panic!("expected Exited"),
        }
    }

    #[tokio::test]
    async fn stale_exit_events_are_ignored() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut child = Child::new(spec("w", 0, 10), tx);
        child.pid = Some(12345);
        child.r#gen = 3;
        child.start_count = 2;

        child.handle_exit(2, 0);

        assert_eq!(child.pid, Some(12345));
        assert_eq!(child.start_count, 2);
    }

    #[tokio::test]
    async fn fast_exit_keeps_the_counter_and_schedules_a_restart() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut child = Child::new(spec("w", 0, 10), tx);
        child.pid = Some(1);
        child.r#gen = 1;
        child.start_count = 1;
        child.started = Some(Instant::now());

        child.handle_exit(1, 0x0100);

        assert_eq!(child.last_status, Some(1));
        assert!(!child.is_alive());
        assert_eq!(child.start_count, 1);
        assert!(!child.broken);

        let ev = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("restart due")
            .expect("channel open");
        match ev {
            Event::RestartDue { name, r#gen } => {
                assert_eq!(name, "w");
                assert_eq!(r#gen, 1);
            }
            _ => panic!("expected RestartDue"),
        }
    }

    #[tokio::test]
    async fn stable_run_resets_the_counter() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut child = Child::new(spec("w", 1, 10), tx);
        child.pid = Some(1);
        child.r#gen = 1;
        child.start_count = 7;
        child.started = Instant::now().checked_sub(Duration::from_secs(5));

        child.handle_exit(1, 0);

        assert_eq!(child.start_count, 0);
        assert!(!child.broken);
        assert!(
            tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn retry_exhaustion_parks_the_child() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut child = Child::new(spec("x", 0, 3), tx);
        child.pid = Some(1);
        child.r#gen = 1;
        child.start_count = 3;
        child.started = Some(Instant::now());

        child.handle_exit(1, 0x0100);

        assert!(child.broken);
        assert!(!child.is_alive());
        assert!(
            tokio::time::timeout(Duration::from_millis(100), rx.recv())
                .await
                .is_err(),
            "broken child must not schedule a restart"
        );
    }

    #[tokio::test]
    async fn operations_without_a_pid_fail() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut child = Child::new(spec("w", 1, 10), tx);

        assert!(child.stop().is_none());
        assert!(child.reload().is_none());
        assert!(child.restart().is_none());
        assert!(child.send_signal(Signal::SIGUSR1).is_none());
    }

    #[tokio::test]
    async fn stop_in_the_backoff_window_cancels_the_pending_restart() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut child = Child::new(spec("w", 0, 10), tx);
        // As after an exit: no pid, a RestartDue for r#gen 1 in flight.
        child.r#gen = 1;
        child.start_count = 1;

        assert!(child.stop().is_none());

        child.handle_restart_due(1);
        assert_eq!(child.start_count, 1, "stale timer must not start the child");
    }

    #[tokio::test]
    async fn stale_or_inapplicable_restart_timers_are_dropped() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut child = Child::new(spec("w", 0, 10), tx);

        child.r#gen = 2;
        child.handle_restart_due(1);
        assert_eq!(child.start_count, 0);

        child.pid = Some(1);
        child.handle_restart_due(2);
        assert_eq!(child.start_count, 0);

        child.pid = None;
        child.broken = true;
        child.handle_restart_due(2);
        assert_eq!(child.start_count, 0);
    }
}
