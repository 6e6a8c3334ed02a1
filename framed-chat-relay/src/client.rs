
use anyhow::{Context, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{self, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    select,
    sync::mpsc,
};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    console::{self, Input},
    envelope::{ChatMessage, ClientEnvelope, ServerEnvelope, unix_now},
    frame::FrameCodec,
};

/// Connection-independent client state: who we asked to be and whether the
/// server has said yes.
#[derive(Debug, Clone)]
pub struct ClientProtocol {
    username: String,
    registered: bool,
}

impl ClientProtocol {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            registered: false,
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn registration(&self) -> ClientEnvelope {
        ClientEnvelope::Register {
            username: self.username.clone(),
        }
    }

    /// Asks for a different username after a rejection.
    pub fn retry(&mut self, username: impl Into<String>) -> ClientEnvelope {
        self.username = username.into();
        self.registration()
    }

    /// Tracks registration state from an inbound envelope.
    pub fn observe(&mut self, envelope: &ServerEnvelope) {
        if let ServerEnvelope::Registration(reply) = envelope {
            self.registered |= reply.accepted;
        }
    }

    pub fn message(&self, destination: impl Into<String>, body: impl Into<String>) -> ClientEnvelope {
        self.message_at(destination, body, unix_now())
    }

    pub fn message_at(
        &self,
        destination: impl Into<String>,
        body: impl Into<String>,
        timestamp: i64,
    ) -> ClientEnvelope {
        ClientEnvelope::Batch {
            messages: vec![ChatMessage::new(
                self.username.clone(),
                destination,
                timestamp,
                body,
            )],
        }
    }
}

/// Protocol state bound to the outbound half of a connection.
pub struct Client<W> {
    protocol: ClientProtocol,
    sink: FramedWrite<W, FrameCodec>,
}

impl<W> Client<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(protocol: ClientProtocol, writer: W) -> Self {
        Self {
            protocol,
            sink: FramedWrite::new(writer, FrameCodec),
        }
    }

    pub fn username(&self) -> &str {
        self.protocol.username()
    }

    pub fn is_registered(&self) -> bool {
        self.protocol.is_registered()
    }

    pub fn observe(&mut self, envelope: &ServerEnvelope) {
        self.protocol.observe(envelope);
    }

    pub async fn register(&mut self) -> Result<()> {
        let envelope = self.protocol.registration();
        self.send(&envelope).await
    }

    pub async fn retry(&mut self, username: &str) -> Result<()> {
        let envelope = self.protocol.retry(username);
        self.send(&envelope).await
    }

    /// Sends `body` to `destination` as a one-message batch from us.
    pub async fn submit(&mut self, destination: &str, body: &str) -> Result<()> {
        let envelope = self.protocol.message(destination, body);
        self.send(&envelope).await
    }

    async fn send(&mut self, envelope: &ClientEnvelope) -> Result<()> {
        let payload = envelope.to_payload()?;
        self.sink
            .send(payload)
            .await
            .context("failed to send frame to server")
    }

    pub async fn close(&mut self) {
        if let Err(error) = self.sink.close().await {
            warn!(?error, "failed to shutdown client writer cleanly");
        }
    }
}

/// One rendered line for the operator.
#[derive(Debug, PartialEq, Eq)]
pub enum Line {
    Out(String),
    Err(String),
}

pub fn render(envelope: &ServerEnvelope, username: &str) -> Vec<Line> {
    match envelope {
        ServerEnvelope::Registration(reply) if reply.accepted => {
            let mut lines = vec![Line::Out(format!("*** connected as {username}"))];
            if let Some(users) = &reply.users {
                lines.push(Line::Out(format!("*** online: {}", users.join(", "))));
            }
            lines.extend(reply.backlog.iter().flatten().map(render_message));
            lines
        }
        ServerEnvelope::Registration(reply) => vec![
            Line::Out(format!("*** username rejected: {}", reply.info)),
            Line::Out("*** choose another username".to_string()),
        ],
        ServerEnvelope::UsersJoined { users } => users
            .iter()
            .map(|user| Line::Out(format!("*** {user} joined the chat")))
            .collect(),
        ServerEnvelope::UsersLeft { users } => users
            .iter()
            .map(|user| Line::Out(format!("*** {user} left the chat")))
            .collect(),
        ServerEnvelope::Messages { messages } => messages.iter().map(render_message).collect(),
        ServerEnvelope::Error { message } => vec![Line::Err(format!("!!! {message}"))],
    }
}

fn render_message(message: &ChatMessage) -> Line {
    if message.is_broadcast() {
        Line::Out(format!("<{}> {}", message.sender, message.body))
    } else {
        Line::Out(format!(
            "<{} to {}> {}",
            message.sender, message.destination, message.body
        ))
    }
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let stream = TcpStream::connect((args.host.as_str(), args.port))
        .await
        .with_context(|| format!("failed to connect to {}:{}", args.host, args.port))?;

    info!("connected to {}:{}", args.host, args.port);

    let (reader, writer) = stream.into_split();
    let mut frames = FramedRead::new(reader, FrameCodec);
    let mut client = Client::new(ClientProtocol::new(args.username), writer);
    client.register().await?;

    let mut lines = spawn_stdin_reader();

    loop {
        select! {
            frame = frames.next() => {
                if !handle_server_frame(frame, &mut client).await? {
                    break;
                }
            }
            line = lines.recv() => {
                if !handle_operator_line(line, &mut client).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }

    client.close().await;
    Ok(())
}

/// Reads stdin on its own thread so a blocking read never stalls the
/// connection; lines come back over a channel.
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else {
                break;
            };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

async fn handle_server_frame<W>(
    frame: Option<io::Result<Bytes>>,
    client: &mut Client<W>,
) -> Result<bool>
where
    W: AsyncWrite + Unpin,
{
    let Some(payload) = frame.transpose()? else {
        write_stdout("*** server closed the connection").await?;
        return Ok(false);
    };

    match ServerEnvelope::parse(&payload) {
        Ok(envelope) => {
            client.observe(&envelope);
            for line in render(&envelope, client.username()) {
                match line {
                    Line::Out(text) => write_stdout(&text).await?,
                    Line::Err(text) => write_stderr(&text).await?,
                }
            }
        }
        Err(error) => {
            warn!(%error, "unreadable frame from server");
            write_stderr(&format!("!!! {}", String::from_utf8_lossy(&payload))).await?;
        }
    }
    Ok(true)
}

async fn handle_operator_line<W>(line: Option<String>, client: &mut Client<W>) -> Result<bool>
where
    W: AsyncWrite + Unpin,
{
    let Some(line) = line else {
        return Ok(false);
    };

    if console::is_quit(&line) {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    if !client.is_registered() {
        let username = line.trim();
        if !username.is_empty() {
            client.retry(username).await?;
        }
        return Ok(true);
    }

    match Input::parse(&line) {
        Ok(Input::Send { destination, body }) => client.submit(&destination, &body).await?,
        Ok(Input::Empty) => {}
        Ok(Input::Quit) => {
            write_stdout("*** leaving chat").await?;
            return Ok(false);
        }
        Err(error) => write_stderr(&format!("!!! {error}")).await?,
    }
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
