use super::ops::*;
use super::*;
use tokio::time::timeout;

pub(super) enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener, PathBuf),
}

impl Listener {
    pub(super) async fn bind(addr: &ListenAddr) -> Result<Self> {
        match addr {
            ListenAddr::Tcp(host, port) => {
                let listener = TcpListener::bind((host.as_str(), *port))
                    .await
                    .with_context(|| format!("bind control socket {host}:{port}"))?;
                Ok(Self::Tcp(listener))
            }
            ListenAddr::Unix(path) => {
                if path.exists() {
                    bail!("control socket {} already exists", path.display());
                }
                let listener = UnixListener::bind(path)
                    .with_context(|| format!("bind control socket {}", path.display()))?;
                Ok(Self::Unix(listener, path.clone()))
            }
        }
    }

    pub(super) fn unix_path(&self) -> Option<PathBuf> {
        match self {
            Self::Tcp(_) => None,
            Self::Unix(_, path) => Some(path.clone()),
        }
    }
}

pub(super) fn spawn_acceptor(listener: Listener, events: EventTx) {
    tokio::spawn(async move {
        loop {
            let accepted = match &listener {
                Listener::Tcp(listener) => listener
                    .accept()
                    .await
                    .map(|(stream, _)| tokio::spawn(handle_conn(stream, events.clone()))),
                Listener::Unix(listener, _) => listener
                    .accept()
                    .await
                    .map(|(stream, _)| tokio::spawn(handle_conn(stream, events.clone()))),
            };
            if let Err(e) = accepted {
                warn!("control accept failed: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    });
}

#[derive(Debug, PartialEq, Eq)]
enum Request {
    Quit,
    Status,
    Op(ChildAction, String),
    Unknown,
}

fn parse_request(line: &str) -> Request {
    match line {
        "quit" | "." => return Request::Quit,
        "status" => return Request::Status,
        _ => {}
    }
    let mut parts = line.split_ascii_whitespace();
    let (Some(op), Some(name), None) = (parts.next(), parts.next(), parts.next()) else {
        return Request::Unknown;
    };
    let action = match op {
        "start" => ChildAction::Start,
        "stop" => ChildAction::Stop,
        "reload" => ChildAction::Reload,
        "restart" => ChildAction::Restart,
        _ => return Request::Unknown,
    };
    Request::Op(action, name.to_string())
}

async fn handle_conn<S>(stream: S, events: EventTx)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);

    loop {
        let line = match read_request_line(&mut reader).await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!("control connection closed: {e}");
                break;
            }
        };

        let lines = match parse_request(&line) {
            Request::Quit => break,
            Request::Status => match dispatch(&events, ControlOp::Status).await {
                Some(ControlReply::Status(rows)) => {
                    rows.iter().map(format_status_row).collect()
                }
                _ => break,
            },
            Request::Op(action, name) => {
                match dispatch(&events, ControlOp::Child { action, name }).await {
                    Some(ControlReply::Result(Some(n))) => vec![format!("{line} {n}")],
                    Some(ControlReply::Result(None)) => vec![format!("{line} fail")],
                    Some(ControlReply::UnknownChild) => vec![format!("{line} unknown")],
                    _ => break,
                }
            }
            Request::Unknown => vec![format!("{line} unknown")],
        };

        if write_response(&mut writer, &lines).await.is_err() {
            break;
        }
    }
}

async fn dispatch(events: &EventTx, op: ControlOp) -> Option<ControlReply> {
    let (reply_tx, reply_rx) = oneshot::channel();
    events.send(Event::Control { op, reply: reply_tx }).ok()?;
    reply_rx.await.ok()
}

async fn read_request_line<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(CONTROL_LINE_MAX);
    loop {
        let byte = match timeout(CONTROL_IDLE_TIMEOUT, reader.read_u8()).await {
            Err(_) => bail!("idle timeout"),
            Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                if buf.is_empty() {
                    return Ok(None);
                }
                bail!("eof inside a request line");
            }
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(byte)) => byte,
        };
        if byte == b'\n' {
            break;
        }
        if buf.len() >= CONTROL_LINE_MAX {
            bail!("request line over {CONTROL_LINE_MAX} bytes");
        }
        buf.push(byte);
    }

    let mut line = String::from_utf8_lossy(&buf).into_owned();
    if line.ends_with('\r') {
        line.pop();
    }
    Ok(Some(line))
}

// Every response is preceded by one blank line; clients parse around it.
// Lines go to the socket one at a time so no response ever queues up in
// a user-space buffer.
async fn write_response<W>(writer: &mut W, lines: &[String]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(b"\n").await?;
    for line in lines {
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
    }
    writer.flush().await
}
