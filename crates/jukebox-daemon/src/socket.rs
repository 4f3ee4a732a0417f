use jukebox_core::dispatcher::PlayerHandle;
use jukebox_core::protocol::{Broadcast, Message, Request, PROTOCOL_VERSION};
use jukebox_core::watchers::ChannelWatcher;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

pub fn start_server(
    bind_address: String,
    port: u16,
    handle: PlayerHandle,
    log_tx: broadcast::Sender<String>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);

        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind TCP socket {}: {}", addr, e);
                return;
            }
        };

        info!("TCP server listening at {}", addr);
        serve(listener, handle, log_tx).await;
    })
}

pub async fn serve(listener: TcpListener, handle: PlayerHandle, log_tx: broadcast::Sender<String>) {
    let mut client_id = 0usize;

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                client_id += 1;
                let id = client_id;
                info!("Client {} connected from {}", id, peer);

                let handle = handle.clone();
                let log_rx = log_tx.subscribe();
                tokio::spawn(async move {
                    handle_client(stream, handle, id, log_rx).await;
                    info!("Client {} disconnected", id);
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    handle: PlayerHandle,
    client_id: usize,
    mut log_rx: broadcast::Receiver<String>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();

    // Each client is a watcher for as long as it stays connected.
    let (watcher, mut events) = ChannelWatcher::pair();
    let watcher_id = match handle.register(Box::new(watcher)) {
        Ok(id) => id,
        Err(e) => {
            warn!("Client {} rejected: {}", client_id, e);
            return;
        }
    };

    // Send Hello with current status on connect
    let hello = match handle.status().await {
        Ok(status) => Broadcast::Hello {
            protocol_version: PROTOCOL_VERSION,
            status,
        },
        Err(e) => Broadcast::Error {
            message: e.to_string(),
        },
    };
    if write_broadcast(&mut write_half, hello).await.is_err() {
        let _ = handle.unregister(watcher_id);
        return;
    }

    'session: loop {
        tokio::select! {
            result = read_half.read(&mut tmp) => {
                match result {
                    Ok(0) => {
                        info!("Client {} closed connection", client_id);
                        break;
                    }
                    Ok(n) => {
                        read_buf.extend_from_slice(&tmp[..n]);

                        loop {
                            match Message::decode(&read_buf) {
                                Ok(Some((Message::Request(request), consumed))) => {
                                    read_buf.drain(..consumed);
                                    info!("Client {} sent request: {:?}", client_id, request);
                                    let reply = respond(&handle, request).await;
                                    if write_broadcast(&mut write_half, reply).await.is_err() {
                                        break 'session;
                                    }
                                }
                                Ok(Some((_, consumed))) => {
                                    read_buf.drain(..consumed);
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    warn!("Client {} sent a bad frame: {}", client_id, e);
                                    let reply = Broadcast::Error { message: e.to_string() };
                                    let _ = write_broadcast(&mut write_half, reply).await;
                                    break 'session;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!("Read error from client {}: {}", client_id, e);
                        break;
                    }
                }
            }

            event = events.recv() => {
                let Some(event) = event else {
                    // Dispatcher dropped us.
                    break;
                };
                if write_broadcast(&mut write_half, Broadcast::Event { event }).await.is_err() {
                    break;
                }
            }

            msg = log_rx.recv() => {
                match msg {
                    Ok(message) => {
                        let _ = write_broadcast(&mut write_half, Broadcast::Log { message }).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client {} missed {} log messages", client_id, n);
                    }
                    Err(_) => break,
                }
            }
        }
    }

    let _ = handle.unregister(watcher_id);
}

/// Answer one request.  Queries get their data back; everything else gets
/// the status as of right after the command ran.
async fn respond(handle: &PlayerHandle, request: Request) -> Broadcast {
    let result = match request {
        Request::GetSong { delta } => {
            return match handle.song(delta).await {
                Ok(track) => Broadcast::Song { delta, track },
                Err(e) => Broadcast::Error {
                    message: e.to_string(),
                },
            };
        }
        Request::GetPosition => {
            return Broadcast::Position {
                position_ms: handle.position_ms(),
                duration_ms: handle.duration_ms(),
            };
        }
        Request::GetStatus => Ok(()),
        Request::TogglePlayback => handle.toggle_playback(),
        Request::Skip { delta } => handle.skip(delta),
        Request::SeekToProgress { permille } => handle.seek_to_progress(permille),
        Request::Enqueue { id } => handle.enqueue(id),
        Request::ResetQueue => handle.reset_queue(),
        Request::CatalogChanged => handle.catalog_changed(),
        Request::HeadsetChanged { plugged } => handle.headset_changed(plugged),
        Request::CallStateChanged { in_call } => handle.call_state_changed(in_call),
        Request::PreferenceChanged { key } => handle.preference_changed(key),
        Request::RefreshPresentation => handle.refresh_presentation(),
    };

    match result {
        Ok(()) => match handle.status().await {
            Ok(data) => Broadcast::Status { data },
            Err(e) => Broadcast::Error {
                message: e.to_string(),
            },
        },
        Err(e) => Broadcast::Error {
            message: e.to_string(),
        },
    }
}

async fn write_broadcast<W>(writer: &mut W, broadcast: Broadcast) -> std::io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let encoded = Message::Broadcast(broadcast)
        .encode()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    writer.write_all(&encoded).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::start_service;
    use jukebox_core::watchers::WatcherEvent;
    use jukebox_core::{PlaybackState, TrackId};

    struct Client {
        stream: TcpStream,
        buf: Vec<u8>,
    }

    impl Client {
        async fn connect(addr: std::net::SocketAddr) -> Self {
            Self {
                stream: TcpStream::connect(addr).await.unwrap(),
                buf: Vec::new(),
            }
        }

        async fn send(&mut self, request: Request) {
            let encoded = Message::Request(request).encode().unwrap();
            self.stream.write_all(&encoded).await.unwrap();
        }

        async fn next(&mut self) -> Broadcast {
            loop {
                if let Some((msg, used)) = Message::decode(&self.buf).unwrap() {
                    self.buf.drain(..used);
                    match msg {
                        Message::Broadcast(b) => return b,
                        Message::Request(r) => panic!("daemon sent a request: {:?}", r),
                    }
                }
                let mut tmp = [0u8; 4096];
                let n = self.stream.read(&mut tmp).await.unwrap();
                assert!(n > 0, "daemon closed the connection");
                self.buf.extend_from_slice(&tmp[..n]);
            }
        }

        /// Next reply, skipping watcher events and log lines.
        async fn reply(&mut self) -> Broadcast {
            loop {
                match self.next().await {
                    Broadcast::Event { .. } | Broadcast::Log { .. } => continue,
                    other => return other,
                }
            }
        }
    }

    async fn start() -> (std::net::SocketAddr, jukebox_core::Service, broadcast::Sender<String>) {
        let (service, _player) = start_service(5);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (log_tx, _) = broadcast::channel(16);
        tokio::spawn(serve(listener, service.handle(), log_tx.clone()));
        (addr, service, log_tx)
    }

    #[tokio::test]
    async fn test_hello_then_queries() {
        let (addr, _service, _log_tx) = start().await;
        let mut client = Client::connect(addr).await;

        let Broadcast::Hello { protocol_version, status } = client.next().await else {
            panic!("expected hello");
        };
        assert_eq!(protocol_version, PROTOCOL_VERSION);
        assert_eq!(status.state, PlaybackState::Paused);
        let current = status.current.unwrap();

        client.send(Request::GetSong { delta: 0 }).await;
        match client.reply().await {
            Broadcast::Song { delta: 0, track } => assert_eq!(track, Some(current)),
            other => panic!("unexpected reply: {:?}", other),
        }

        client.send(Request::GetPosition).await;
        assert_eq!(
            client.reply().await,
            Broadcast::Position {
                position_ms: 0,
                duration_ms: 180_000
            }
        );
    }

    #[tokio::test]
    async fn test_enqueue_and_skip_reach_the_client() {
        let (addr, _service, _log_tx) = start().await;
        let mut client = Client::connect(addr).await;
        client.next().await;

        client.send(Request::Enqueue { id: TrackId(4) }).await;
        client.reply().await;
        client.send(Request::Skip { delta: 1 }).await;

        // The song change arrives as a watcher event.
        loop {
            match client.next().await {
                Broadcast::Event {
                    event: WatcherEvent::SongChanged { track: Some(track) },
                } => {
                    assert_eq!(track.id, TrackId(4));
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_logs_are_forwarded() {
        let (addr, _service, log_tx) = start().await;
        let mut client = Client::connect(addr).await;
        client.next().await;
        // Round-trip once so the client task is subscribed and listening.
        client.send(Request::GetStatus).await;
        client.reply().await;

        log_tx.send("12:00:00 [WARN] disk full".into()).unwrap();
        loop {
            if let Broadcast::Log { message } = client.next().await {
                assert!(message.contains("disk full"));
                break;
            }
        }
    }
}
