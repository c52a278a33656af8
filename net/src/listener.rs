//! The server-side demultiplexer: one shared UDP socket, many sessions
//! keyed by remote address. See spec.md §4.3.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arq_core::Profile;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tracing::debug;

use crate::crypto::Codec;
use crate::error::Error;
use crate::session::Session;

/// Bound on both the accept channel and the raw-datagram intake channel.
/// Overflow on the accept channel blocks the monitor task; this is
/// acceptable backpressure per spec.md §4.3.
const ACCEPT_CHANNEL_CAPACITY: usize = 1024;
const INTAKE_CHANNEL_CAPACITY: usize = 1024;

struct SessionEntry {
    session: Session,
    tick_tx: mpsc::Sender<u32>,
}

/// A listening endpoint that demultiplexes inbound datagrams by source
/// address into sessions, minting a new one on first contact.
pub struct Listener {
    inner: Arc<ListenerInner>,
}

struct ListenerInner {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    mode: Profile,
    codec: Option<Arc<Codec>>,
    sessions: DashMap<SocketAddr, SessionEntry>,
    accept_rx: AsyncMutex<mpsc::Receiver<Session>>,
    dead_tx: mpsc::Sender<SocketAddr>,
    die: Notify,
    closed: AtomicBool,
}

impl Listener {
    pub(crate) async fn bind(
        mode: Profile,
        local_addr: SocketAddr,
        codec: Option<Arc<Codec>>,
    ) -> Result<Listener, Error> {
        let socket = Arc::new(
            UdpSocket::bind(local_addr)
                .await
                .map_err(|e| Error::SocketBindFailed(Arc::new(e)))?,
        );
        let local_addr = socket.local_addr()?;

        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_CHANNEL_CAPACITY);
        let (intake_tx, intake_rx) = mpsc::channel(INTAKE_CHANNEL_CAPACITY);
        let (dead_tx, dead_rx) = mpsc::channel(ACCEPT_CHANNEL_CAPACITY);

        let inner = Arc::new(ListenerInner {
            socket: socket.clone(),
            local_addr,
            mode,
            codec,
            sessions: DashMap::new(),
            accept_rx: AsyncMutex::new(accept_rx),
            dead_tx,
            die: Notify::new(),
            closed: AtomicBool::new(false),
        });

        tokio::spawn(run_receiver(inner.clone(), socket, intake_tx));
        tokio::spawn(run_monitor(inner.clone(), intake_rx, dead_rx, accept_tx));

        Ok(Listener { inner })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Waits for the next inbound session. Fails with `ListenerStopped` once
    /// the listener has been closed.
    pub async fn accept(&self) -> Result<Session, Error> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::ListenerStopped);
        }

        let mut rx = self.inner.accept_rx.lock().await;
        tokio::select! {
            maybe_session = rx.recv() => maybe_session.ok_or(Error::ListenerStopped),
            _ = self.inner.die.notified() => Err(Error::ListenerStopped),
        }
    }

    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            self.inner.die.notify_waiters();
        }
    }
}

async fn run_receiver(
    inner: Arc<ListenerInner>,
    socket: Arc<UdpSocket>,
    intake_tx: mpsc::Sender<(SocketAddr, Vec<u8>)>,
) {
    let mut buf = vec![0u8; 65536];
    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((n, addr)) => {
                        if intake_tx.send((addr, buf[..n].to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!(error = %e, "listener socket recv error"),
                }
            }
            _ = inner.die.notified() => break,
        }
    }
}

async fn run_monitor(
    inner: Arc<ListenerInner>,
    mut intake_rx: mpsc::Receiver<(SocketAddr, Vec<u8>)>,
    mut dead_rx: mpsc::Receiver<SocketAddr>,
    accept_tx: mpsc::Sender<Session>,
) {
    let start = Instant::now();
    let mut ticker = tokio::time::interval(Duration::from_millis(10));

    loop {
        tokio::select! {
            maybe_datagram = intake_rx.recv() => {
                let Some((addr, raw)) = maybe_datagram else { break };
                handle_datagram(&inner, addr, raw, &accept_tx).await;
            }
            maybe_dead = dead_rx.recv() => {
                let Some(addr) = maybe_dead else { continue };
                inner.sessions.remove(&addr);
            }
            _ = ticker.tick() => {
                let now = start.elapsed().as_millis() as u32;
                for entry in inner.sessions.iter() {
                    // Non-blocking: a dropped tick is harmless, since
                    // Update/Check are idempotent against elapsed time.
                    let _ = entry.value().tick_tx.try_send(now);
                }
            }
            _ = inner.die.notified() => break,
        }
    }
}

async fn handle_datagram(
    inner: &Arc<ListenerInner>,
    addr: SocketAddr,
    raw: Vec<u8>,
    accept_tx: &mpsc::Sender<Session>,
) {
    let plaintext = match &inner.codec {
        Some(codec) => match codec.decrypt(&raw) {
            Some(p) => p,
            None => {
                debug!(%addr, "dropping datagram that failed the obfuscation checksum");
                return;
            }
        },
        None => raw,
    };

    if plaintext.len() < arq_core::HEADER_SIZE {
        debug!(%addr, len = plaintext.len(), "dropping undersized datagram");
        return;
    }

    if let Some(entry) = inner.sessions.get(&addr) {
        entry.value().session.deliver_input(&plaintext).await;
        return;
    }

    let conv = u32::from_le_bytes(plaintext[0..4].try_into().expect("checked len above"));

    let (session, tick_tx) = Session::new_server(
        conv,
        inner.mode,
        inner.socket.clone(),
        inner.local_addr,
        addr,
        inner.codec.clone(),
        inner.dead_tx.clone(),
    );

    session.deliver_input(&plaintext).await;
    inner.sessions.insert(addr, SessionEntry { session: session.clone(), tick_tx });

    if accept_tx.send(session).await.is_err() {
        debug!("accept channel closed, dropping newly minted session");
    }
}
