//! In-memory loopback transport.
//!
//! [`pair`] returns the client half, which implements [`Transport`], and a
//! [`MemoryPeer`] that plays the server: it accepts announced streams, can
//! send a GOAWAY, and can sever the connection abruptly. Each stream is a
//! pair of bounded channels; the bound is the per-stream window in frames.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use super::{ConnectionId, Dialer, GoAway, Transport};
use crate::error::TransportError;
use crate::stream::StreamId;

type ResponseFrame = Result<Bytes, TransportError>;
type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<ResponseFrame>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireState {
    Up,
    /// The client released the connection.
    Released,
    /// The peer dropped the connection.
    Severed,
}

/// Flags shared by both halves of one stream.
#[derive(Debug, Default)]
struct StreamFlags {
    /// Set by the peer before it drops a refused stream.
    refused: AtomicBool,
    /// Set by the peer before it ends the response normally.
    finished: AtomicBool,
    /// Set by the client before it abandons the stream.
    reset: AtomicBool,
}

/// Client-side half of one stream.
struct Slot {
    request_tx: Option<mpsc::Sender<Bytes>>,
    response_rx: SharedReceiver,
    flags: Arc<StreamFlags>,
}

/// Peer bookkeeping for GOAWAY. Accept and GOAWAY serialize on this.
#[derive(Default)]
struct PeerState {
    highest_accepted: Option<StreamId>,
    /// `Some` once GOAWAY was sent.
    watermark: Option<Option<StreamId>>,
    goaway_tx: Option<oneshot::Sender<GoAway>>,
}

struct Wire {
    id: ConnectionId,
    window: usize,
    state: watch::Sender<WireState>,
    streams: Mutex<HashMap<StreamId, Slot>>,
    incoming: Mutex<Option<mpsc::UnboundedSender<PeerStream>>>,
    goaway_rx: Mutex<Option<oneshot::Receiver<GoAway>>>,
    peer: Mutex<PeerState>,
}

impl Wire {
    fn state(&self) -> WireState {
        *self.state.borrow()
    }

    fn check_up(&self) -> Result<(), TransportError> {
        match self.state() {
            WireState::Up => Ok(()),
            WireState::Released => Err(TransportError::Closed),
            WireState::Severed => Err(self.lost()),
        }
    }

    async fn severed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == WireState::Severed).await;
    }

    fn lost(&self) -> TransportError {
        TransportError::ConnectionLost(format!("connection {} severed by peer", self.id))
    }

    fn send_goaway(&self) -> bool {
        let mut peer = self.peer.lock().expect("peer lock");
        if peer.watermark.is_some() {
            return false;
        }
        let last = peer.highest_accepted;
        peer.watermark = Some(last);
        if let Some(tx) = peer.goaway_tx.take() {
            let _ = tx.send(GoAway::new(last));
        }
        debug!(connection = %self.id, last_stream_id = ?last, "peer sent goaway");
        true
    }
}

/// Create a connected client/peer pair. A zero window is raised to one
/// frame.
pub fn pair(id: ConnectionId, window: usize) -> (MemoryTransport, MemoryPeer) {
    let window = window.max(1);
    let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
    let (goaway_tx, goaway_rx) = oneshot::channel();
    let wire = Arc::new(Wire {
        id,
        window,
        state: watch::channel(WireState::Up).0,
        streams: Mutex::new(HashMap::new()),
        incoming: Mutex::new(Some(incoming_tx)),
        goaway_rx: Mutex::new(Some(goaway_rx)),
        peer: Mutex::new(PeerState {
            goaway_tx: Some(goaway_tx),
            ..PeerState::default()
        }),
    });
    (
        MemoryTransport {
            wire: Arc::clone(&wire),
        },
        MemoryPeer {
            wire,
            incoming: incoming_rx,
        },
    )
}

/// Client half of a memory connection.
pub struct MemoryTransport {
    wire: Arc<Wire>,
}

impl MemoryTransport {
    /// Streams the transport still holds state for.
    pub fn stream_count(&self) -> usize {
        self.wire.streams.lock().expect("streams lock").len()
    }

    fn sender(&self, id: StreamId) -> Result<(mpsc::Sender<Bytes>, Arc<StreamFlags>), TransportError> {
        let streams = self.wire.streams.lock().expect("streams lock");
        let slot = streams.get(&id).ok_or(TransportError::StreamReset(id))?;
        let tx = slot
            .request_tx
            .clone()
            .ok_or(TransportError::StreamReset(id))?;
        Ok((tx, Arc::clone(&slot.flags)))
    }

    fn receiver(&self, id: StreamId) -> Result<(SharedReceiver, Arc<StreamFlags>), TransportError> {
        let streams = self.wire.streams.lock().expect("streams lock");
        let slot = streams.get(&id).ok_or(TransportError::StreamReset(id))?;
        Ok((Arc::clone(&slot.response_rx), Arc::clone(&slot.flags)))
    }
}

impl Transport for MemoryTransport {
    fn id(&self) -> ConnectionId {
        self.wire.id
    }

    fn open(&self, id: StreamId) -> Result<(), TransportError> {
        self.wire.check_up()?;
        let (request_tx, request_rx) = mpsc::channel(self.wire.window);
        let (response_tx, response_rx) = mpsc::channel(self.wire.window);
        let flags = Arc::new(StreamFlags::default());

        self.wire.streams.lock().expect("streams lock").insert(
            id,
            Slot {
                request_tx: Some(request_tx),
                response_rx: Arc::new(tokio::sync::Mutex::new(response_rx)),
                flags: Arc::clone(&flags),
            },
        );

        let peer_stream = PeerStream {
            id,
            request_rx,
            response_tx: Some(response_tx),
            flags,
        };
        let announced = match self.wire.incoming.lock().expect("incoming lock").as_ref() {
            Some(tx) => tx.send(peer_stream).is_ok(),
            None => false,
        };
        if !announced {
            self.wire.streams.lock().expect("streams lock").remove(&id);
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    async fn send_bytes(&self, id: StreamId, chunk: Bytes) -> Result<(), TransportError> {
        self.wire.check_up()?;
        let (tx, flags) = self.sender(id)?;
        tokio::select! {
            sent = tx.send(chunk) => sent.map_err(|_| {
                if flags.refused.load(Ordering::Acquire) {
                    TransportError::Refused(id)
                } else {
                    TransportError::StreamReset(id)
                }
            }),
            _ = self.wire.severed() => Err(self.wire.lost()),
        }
    }

    fn finish(&self, id: StreamId) -> Result<(), TransportError> {
        self.wire.check_up()?;
        let mut streams = self.wire.streams.lock().expect("streams lock");
        let slot = streams
            .get_mut(&id)
            .ok_or(TransportError::StreamReset(id))?;
        // Dropping the sender is the end-of-body marker.
        slot.request_tx.take();
        Ok(())
    }

    async fn receive_bytes(&self, id: StreamId) -> Result<Option<Bytes>, TransportError> {
        self.wire.check_up()?;
        let (rx, flags) = self.receiver(id)?;
        let frame = tokio::select! {
            frame = async { rx.lock().await.recv().await } => frame,
            _ = self.wire.severed() => return Err(self.wire.lost()),
        };
        match frame {
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(e)) => Err(e),
            None if flags.finished.load(Ordering::Acquire) => Ok(None),
            None if flags.refused.load(Ordering::Acquire) => Err(TransportError::Refused(id)),
            None if self.wire.state() == WireState::Severed => Err(self.wire.lost()),
            None => Err(TransportError::StreamReset(id)),
        }
    }

    fn reset(&self, id: StreamId) {
        let slot = self.wire.streams.lock().expect("streams lock").remove(&id);
        if let Some(slot) = slot {
            slot.flags.reset.store(true, Ordering::Release);
            debug!(connection = %self.wire.id, stream = %id, "stream reset");
        }
    }

    fn release(&self, id: StreamId) {
        self.wire.streams.lock().expect("streams lock").remove(&id);
    }

    fn take_shutdown_signal(&self) -> Option<oneshot::Receiver<GoAway>> {
        self.wire.goaway_rx.lock().expect("goaway lock").take()
    }

    fn close(&self) {
        let released = self.wire.state.send_if_modified(|s| {
            if *s == WireState::Up {
                *s = WireState::Released;
                true
            } else {
                false
            }
        });
        self.wire.incoming.lock().expect("incoming lock").take();
        let streams: Vec<Slot> = self
            .wire
            .streams
            .lock()
            .expect("streams lock")
            .drain()
            .map(|(_, slot)| slot)
            .collect();
        for slot in &streams {
            slot.flags.reset.store(true, Ordering::Release);
        }
        if released {
            debug!(connection = %self.wire.id, "transport released");
        }
    }
}

/// Peer (server) half of a memory connection.
pub struct MemoryPeer {
    wire: Arc<Wire>,
    incoming: mpsc::UnboundedReceiver<PeerStream>,
}

impl MemoryPeer {
    pub fn id(&self) -> ConnectionId {
        self.wire.id
    }

    /// Next announced stream. Streams above the GOAWAY watermark are refused
    /// and skipped. Returns `None` once the client released the connection.
    pub async fn accept(&mut self) -> Option<PeerStream> {
        loop {
            let stream = self.incoming.recv().await?;
            let mut peer = self.wire.peer.lock().expect("peer lock");
            if let Some(watermark) = peer.watermark {
                let refused = match watermark {
                    Some(last) => stream.id > last,
                    None => true,
                };
                if refused {
                    drop(peer);
                    debug!(connection = %self.wire.id, stream = %stream.id, "peer refused stream after goaway");
                    stream.refuse();
                    continue;
                }
            }
            peer.highest_accepted = Some(match peer.highest_accepted {
                Some(prev) if prev > stream.id => prev,
                _ => stream.id,
            });
            return Some(stream);
        }
    }

    /// Handle for sending GOAWAY from other tasks.
    pub fn goaway_handle(&self) -> GoAwayHandle {
        GoAwayHandle {
            wire: Arc::clone(&self.wire),
        }
    }

    /// Send GOAWAY carrying the highest accepted stream id. Returns `false`
    /// if it was already sent.
    pub fn send_goaway(&self) -> bool {
        self.wire.send_goaway()
    }

    /// Drop the connection abruptly. Every pending client operation fails.
    pub fn sever(&self) {
        let severed = self.wire.state.send_if_modified(|s| {
            if *s == WireState::Up {
                *s = WireState::Severed;
                true
            } else {
                false
            }
        });
        if severed {
            warn!(connection = %self.wire.id, "peer severed connection");
        }
    }

    /// Wait until the client releases the connection.
    pub async fn released(&self) {
        let mut rx = self.wire.state.subscribe();
        let _ = rx.wait_for(|s| *s != WireState::Up).await;
    }

    pub fn is_released(&self) -> bool {
        self.wire.state() == WireState::Released
    }
}

/// Clonable GOAWAY trigger.
#[derive(Clone)]
pub struct GoAwayHandle {
    wire: Arc<Wire>,
}

impl GoAwayHandle {
    pub fn send(&self) -> bool {
        self.wire.send_goaway()
    }
}

/// Peer side of one stream.
pub struct PeerStream {
    id: StreamId,
    request_rx: mpsc::Receiver<Bytes>,
    response_tx: Option<mpsc::Sender<ResponseFrame>>,
    flags: Arc<StreamFlags>,
}

impl PeerStream {
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Next request chunk, or `None` once the client finished the body.
    pub async fn read_chunk(&mut self) -> Result<Option<Bytes>, TransportError> {
        match self.request_rx.recv().await {
            Some(chunk) => Ok(Some(chunk)),
            None if self.flags.reset.load(Ordering::Acquire) => {
                Err(TransportError::StreamReset(self.id))
            }
            None => Ok(None),
        }
    }

    /// Read the whole request body.
    pub async fn read_to_end(&mut self) -> Result<Bytes, TransportError> {
        let mut body = BytesMut::new();
        while let Some(chunk) = self.read_chunk().await? {
            body.extend_from_slice(&chunk);
        }
        Ok(body.freeze())
    }

    pub async fn write(&mut self, chunk: Bytes) -> Result<(), TransportError> {
        let tx = self
            .response_tx
            .as_ref()
            .ok_or(TransportError::StreamReset(self.id))?;
        tx.send(Ok(chunk))
            .await
            .map_err(|_| TransportError::StreamReset(self.id))
    }

    /// End the response body.
    pub fn finish(mut self) {
        self.flags.finished.store(true, Ordering::Release);
        self.response_tx.take();
    }

    fn refuse(self) {
        self.flags.refused.store(true, Ordering::Release);
    }
}

/// Dials memory connections, handing each peer half to `on_dial`.
pub struct MemoryDialer<F> {
    window: usize,
    next_id: AtomicU64,
    on_dial: F,
}

impl<F> MemoryDialer<F>
where
    F: Fn(MemoryPeer) + Send + Sync + 'static,
{
    pub fn new(window: usize, on_dial: F) -> Self {
        Self {
            window,
            next_id: AtomicU64::new(1),
            on_dial,
        }
    }

    /// Number of connections dialed so far.
    pub fn dialed(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed) - 1
    }
}

impl<F> Dialer for MemoryDialer<F>
where
    F: Fn(MemoryPeer) + Send + Sync + 'static,
{
    type Transport = MemoryTransport;

    async fn dial(&self) -> Result<MemoryTransport, TransportError> {
        if self.window == 0 {
            return Err(TransportError::Dial("stream window must be > 0".into()));
        }
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (transport, peer) = pair(id, self.window);
        (self.on_dial)(peer);
        debug!(connection = %id, "dialed memory connection");
        Ok(transport)
    }
}
