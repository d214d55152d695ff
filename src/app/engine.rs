use super::control::{Listener, spawn_acceptor};
use super::supervisor::Child;
use super::*;
use tokio::signal::unix::{SignalKind, signal as unix_signal};

struct Engine {
    children: HashMap<String, Child>,
}

pub(super) async fn run(config: Config) -> Result<()> {
    if let Some(mask) = config.umask {
        nix::sys::stat::umask(nix::sys::stat::Mode::from_bits_truncate(
            mask as nix::libc::mode_t,
        ));
    }

    let mut sigint = unix_signal(SignalKind::interrupt()).context("install INT handler")?;
    let mut sighup = unix_signal(SignalKind::hangup()).context("install HUP handler")?;
    let mut sigterm = unix_signal(SignalKind::terminate()).context("install TERM handler")?;

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();

    let socket_path = match &config.listen {
        Some(addr) => {
            let listener = Listener::bind(addr).await?;
            let path = listener.unix_path();
            spawn_acceptor(listener, events_tx.clone());
            path
        }
        None => None,
    };

    let mut engine = Engine {
        children: HashMap::new(),
    };
    for spec in config.children {
        engine
            .children
            .insert(spec.name.clone(), Child::new(spec, events_tx.clone()));
    }

    info!("supervising {} children", engine.children.len());
    for child in engine.children.values_mut() {
        child.start();
    }

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                let alive = engine.alive_count();
                let sent = engine.broadcast(Signal::SIGINT);
                debug!("INT fan-out reached {sent} of {alive} live children");
                if alive == 0 {
                    info!("INT with no live children, shutting down");
                    break;
                }
            }
            _ = sighup.recv() => {
                let sent = engine.broadcast(Signal::SIGHUP);
                debug!("HUP fan-out reached {sent} children");
            }
            _ = sigterm.recv() => {
                let sent = engine.broadcast(Signal::SIGTERM);
                info!("TERM received, shutting down ({sent} children signaled)");
                break;
            }
            ev = events_rx.recv() => {
                let Some(ev) = ev else { break };
                engine.handle_event(ev);
            }
        }
    }

    if let Some(path) = socket_path {
        let _ = fs::remove_file(path);
    }
    Ok(())
}

impl Engine {
    fn alive_count(&self) -> usize {
        self.children.values().filter(|c| c.is_alive()).count()
    }

    fn broadcast(&self, sig: Signal) -> usize {
        self.children
            .values()
            .filter(|c| c.send_signal(sig).is_some())
            .count()
    }

    fn handle_event(&mut self, ev: Event) {
        match ev {
            Event::Exited { name, r#gen, raw } => {
                if let Some(child) = self.children.get_mut(&name) {
                    child.handle_exit(r#gen, raw);
                }
            }
            Event::RestartDue { name, r#gen } => {
                if let Some(child) = self.children.get_mut(&name) {
                    child.handle_restart_due(r#gen);
                }
            }
            Event::Control { op, reply } => {
                let _ = reply.send(self.handle_control(op));
            }
        }
    }

    fn handle_control(&mut self, op: ControlOp) -> ControlReply {
        match op {
            ControlOp::Status => {
                let mut rows: Vec<StatusRow> =
                    self.children.values().map(Child::status_row).collect();
                rows.sort_by(|a, b| a.name.cmp(&b.name));
                ControlReply::Status(rows)
            }
            ControlOp::Child { action, name } => match self.children.get_mut(&name) {
                None => ControlReply::UnknownChild,
                Some(child) => ControlReply::Result(match action {
                    ChildAction::Start => child.start(),
                    ChildAction::Stop => child.stop(),
                    ChildAction::Reload => child.reload(),
                    ChildAction::Restart => child.restart(),
                }),
            },
        }
    }
}
