use std::{
    future::Future,
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
};

use anyhow::Result;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    select,
    sync::mpsc,
};
use tracing::{debug, info, warn};

use crate::{
    router::{Event, Router},
    session::{FrameReader, SessionId},
};

pub struct Server {
    listener: TcpListener,
    next_id: AtomicU64,
}

impl Server {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let (events, inbox) = mpsc::unbounded_channel();
        let router = tokio::spawn(Router::new().run(inbox));
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("server shutting down");
                    let _ = events.send(Event::Shutdown);
                    break;
                }
                accept_result = self.listener.accept() => {
                    self.handle_accept_result(accept_result, &events);
                }
            }
        }

        if let Err(err) = router.await {
            warn!(error = ?err, "router task failed");
        }
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }

    fn handle_accept_result(
        &self,
        result: std::io::Result<(TcpStream, SocketAddr)>,
        events: &mpsc::UnboundedSender<Event>,
    ) {
        match result {
            Ok((stream, peer)) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                info!(session = id, %peer, "accepted connection");
                spawn_connection(stream, id, peer, events.clone());
            }
            Err(err) => warn!(error = ?err, "failed to accept connection"),
        }
    }
}

fn spawn_connection(
    stream: TcpStream,
    id: SessionId,
    peer: SocketAddr,
    events: mpsc::UnboundedSender<Event>,
) {
    tokio::spawn(async move {
        let result = handle_connection(stream, id, peer, &events).await;
        if let Err(err) = &result {
            debug!(session = id, %peer, error = ?err, "connection ended with error");
        }
        let _ = events.send(Event::Disconnected {
            id,
            error: result.err().map(|err| err.to_string()),
        });
    });
}

/// Pumps one socket: complete inbound frames go to the router, frames the
/// router queued for this session go out. Returns once either side is done.
async fn handle_connection(
    stream: TcpStream,
    id: SessionId,
    peer: SocketAddr,
    events: &mpsc::UnboundedSender<Event>,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = FrameReader::new(reader);
    let (outbox, mut outgoing) = mpsc::unbounded_channel();

    events.send(Event::Connected {
        id,
        peer: Some(peer),
        outbox,
    })?;

    loop {
        select! {
            frames = reader.read_frames() => {
                let Some(frames) = frames? else {
                    break;
                };
                for payload in frames {
                    events.send(Event::Frame { id, payload })?;
                }
            }
            frame = outgoing.recv() => {
                let Some(frame) = frame else {
                    debug!(session = id, "router released session");
                    break;
                };
                writer.write_all(&frame).await?;
            }
        }
    }

    if let Err(err) = writer.shutdown().await {
        debug!(session = id, error = ?err, "failed to shut down writer cleanly");
    }
    Ok(())
}
