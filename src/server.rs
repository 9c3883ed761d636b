//! TCP transport for broadcasting clients.
//!
//! Accepts client connections, decodes inbound packets into registry
//! events, and routes the viewport's start/stop commands back to the
//! clients they target. One handler task per connection; a connection drop
//! (or a liveness timeout observed via the session's cancellation token)
//! tears the client down.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::protocol::{
    CommandMsg, DeregisterMsg, HeartbeatMsg, Packet, PacketType, RegisterMsg, ScreenFrameMsg,
};
use crate::registry::SessionRegistry;
use crate::viewport::{Broadcast, ControlCommand};

/// Per-connection outbound queue depth. Control commands are tiny and
/// rare; a stalled client hitting this bound is already dead weight.
const OUTBOUND_CHANNEL_CAPACITY: usize = 32;

/// Maps client ids to their connection's outbound packet queue.
#[derive(Clone, Default)]
pub struct OutboundRouter {
    inner: Arc<RwLock<HashMap<String, mpsc::Sender<Packet>>>>,
}

impl OutboundRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the outbound slot for `id`. Returns `false` if another
    /// connection already holds it.
    fn try_insert(&self, id: &str, tx: mpsc::Sender<Packet>) -> bool {
        let mut inner = self.inner.write();
        if inner.contains_key(id) {
            return false;
        }
        inner.insert(id.to_string(), tx);
        true
    }

    fn remove(&self, id: &str) {
        self.inner.write().remove(id);
    }

    /// Deliver one control broadcast to every targeted client that still
    /// has a connection. Clients without one are skipped -- they are either
    /// gone or mid-teardown.
    pub fn dispatch(&self, broadcast: &Broadcast) {
        let packet_type = match broadcast.command {
            ControlCommand::Send => PacketType::Send,
            ControlCommand::Stop => PacketType::Stop,
        };
        let msg = CommandMsg {
            resolution: broadcast.resolution,
        };
        let packet = match Packet::control(packet_type, &msg) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::error!(?e, "failed to encode control packet");
                return;
            }
        };

        let senders = self.inner.read();
        for id in &broadcast.client_ids {
            let Some(tx) = senders.get(id) else {
                tracing::debug!(client = %id, "no connection for control command");
                continue;
            };
            if let Err(e) = tx.try_send(packet.clone()) {
                tracing::warn!(client = %id, ?e, "dropping control command");
            }
        }
    }
}

/// Run the TCP accept loop until `cancel` fires.
///
/// Also consumes the viewport's command channel, routing each broadcast to
/// the connections it targets.
pub async fn serve(
    listener: TcpListener,
    registry: SessionRegistry,
    mut commands: mpsc::UnboundedReceiver<Broadcast>,
    cancel: CancellationToken,
) -> io::Result<()> {
    let router = OutboundRouter::new();

    // Command dispatch task: viewport → per-connection writers.
    {
        let router = router.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    command = commands.recv() => match command {
                        Some(broadcast) => router.dispatch(&broadcast),
                        None => break,
                    }
                }
            }
        });
    }

    let addr = listener.local_addr()?;
    tracing::info!(%addr, "screen-share server listening");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("server received cancel signal, stopping accept loop");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let registry = registry.clone();
                        let router = router.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, registry, router).await {
                                tracing::debug!(%peer, ?e, "client connection ended");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(?e, "failed to accept connection");
                        // Backoff to prevent a tight loop under sustained
                        // accept errors.
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Handle one client connection.
///
/// The first packet must be `Register`; after that the read loop feeds
/// frames and heartbeats to the registry until the client deregisters,
/// disconnects, or is timed out by the registry.
async fn handle_connection<S: AsyncRead + AsyncWrite + Unpin + Send + 'static>(
    stream: S,
    registry: SessionRegistry,
    router: OutboundRouter,
) -> io::Result<()> {
    let (mut reader, mut writer) = tokio::io::split(stream);

    let first = Packet::read_from(&mut reader).await?;
    if first.packet_type != PacketType::Register {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("expected Register, got {:?}", first.packet_type),
        ));
    }
    let register: RegisterMsg = first
        .parse_json()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let client_id = register.id.clone();

    // Claim the outbound slot BEFORE registering: the registration emits a
    // membership snapshot, and the resulting Send command must find this
    // connection in the router. A duplicate id is refused either way; the
    // original session and its connection stay authoritative.
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Packet>(OUTBOUND_CHANNEL_CAPACITY);
    if !router.try_insert(&client_id, outbound_tx) {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("client id already connected: {client_id}"),
        ));
    }
    if !registry.register(&client_id, &register.name) {
        router.remove(&client_id);
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("client id already in use: {client_id}"),
        ));
    }
    let Some(session) = registry.get(&client_id) else {
        // Removed between insert and lookup (instant drain) -- nothing to do.
        router.remove(&client_id);
        return Ok(());
    };

    // Writer task: drains the outbound queue onto the socket.
    let writer_task = tokio::spawn(async move {
        while let Some(packet) = outbound_rx.recv().await {
            if packet.write_to(&mut writer).await.is_err() {
                break;
            }
        }
    });

    let cancelled = session.cancelled.clone();
    let result = loop {
        tokio::select! {
            // Liveness timeout (or drain) removed the session -- close the
            // connection instead of feeding events to ghost state.
            _ = cancelled.cancelled() => break Ok(()),
            result = Packet::read_from(&mut reader) => {
                let packet = match result {
                    Ok(packet) => packet,
                    Err(e) => break Err(e),
                };
                match packet.packet_type {
                    PacketType::ScreenFrame => match packet.parse_json::<ScreenFrameMsg>() {
                        Ok(msg) => registry.on_frame_arrived(&msg.id, msg.frame),
                        Err(e) => tracing::debug!(client = %client_id, ?e, "bad frame payload"),
                    },
                    PacketType::Heartbeat => match packet.parse_json::<HeartbeatMsg>() {
                        Ok(msg) => registry.on_heartbeat_ack(&msg.id),
                        Err(e) => tracing::debug!(client = %client_id, ?e, "bad heartbeat payload"),
                    },
                    PacketType::Deregister => {
                        match packet.parse_json::<DeregisterMsg>() {
                            Ok(msg) => registry.deregister(&msg.id),
                            Err(e) => tracing::debug!(client = %client_id, ?e, "bad deregister payload"),
                        }
                        break Ok(());
                    }
                    other => {
                        tracing::debug!(client = %client_id, ?other, "unexpected inbound packet");
                    }
                }
            }
        }
    };

    router.remove(&client_id);
    // A vanished connection is treated like an explicit deregister.
    registry.deregister(&client_id);
    writer_task.abort();
    result
}
