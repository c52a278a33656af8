//! The session driver: binds one [`arq_core::Engine`] to one UDP socket and
//! one remote address, and hosts the tick/emit/ingest activities that pump
//! it. See spec.md §4.2.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use arq_core::modular_cmp::mod_geq;
use arq_core::{Engine, InputOutcome, Profile};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tracing::debug;

use crate::crypto::Codec;
use crate::error::Error;

/// Capacity of the bounded outbound-datagram channel the engine's output
/// sink feeds and the emit task drains. Sized to `snd_wnd` per spec.md §9.
const OUTBOUND_CHANNEL_SLOP: usize = 4;

/// One endpoint of a reliable session: a connection-like bidirectional byte
/// stream, cheaply cloneable (the clone shares the same underlying state).
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

struct Inner {
    engine: AsyncMutex<Engine>,
    conv: u32,
    local: SocketAddr,
    remote: SocketAddr,
    codec: Option<Arc<Codec>>,

    read_wake: Notify,
    die: Notify,
    closed: AtomicBool,
    needs_update: AtomicBool,
    next_update: AtomicU32,

    residual: StdMutex<Vec<u8>>,
    read_deadline: StdMutex<Option<Instant>>,

    /// Present only for server-side sessions: lets `close` tell the
    /// listener's monitor task to reclaim this address's map entry, per
    /// spec.md §4.2 "for server sessions the listener reclaims the entry on
    /// notification."
    reclaim: Option<(mpsc::Sender<SocketAddr>, SocketAddr)>,
}

impl Session {
    /// Creates a client-side session: binds its own socket, and runs tick,
    /// emit, and ingest as independent tasks. See spec.md §4.2.
    pub(crate) fn new_client(
        conv: u32,
        mode: Profile,
        socket: UdpSocket,
        local: SocketAddr,
        remote: SocketAddr,
        codec: Option<Arc<Codec>>,
    ) -> Session {
        let socket = Arc::new(socket);
        let (outbound_tx, outbound_rx) = mpsc::channel(snd_wnd_capacity(mode));

        let engine = build_engine(conv, mode, codec.as_deref(), outbound_tx);

        let inner = Arc::new(Inner {
            engine: AsyncMutex::new(engine),
            conv,
            local,
            remote,
            codec: codec.clone(),
            read_wake: Notify::new(),
            die: Notify::new(),
            closed: AtomicBool::new(false),
            needs_update: AtomicBool::new(true),
            next_update: AtomicU32::new(0),
            residual: StdMutex::new(Vec::new()),
            read_deadline: StdMutex::new(None),
            reclaim: None,
        });

        tokio::spawn(run_emit(inner.clone(), socket.clone(), outbound_rx));
        tokio::spawn(run_client_tick(inner.clone()));
        tokio::spawn(run_client_ingest(inner.clone(), socket));

        Session { inner }
    }

    /// Creates a server-side session out of an already-demultiplexed
    /// address on a socket the listener shares across every session. The
    /// caller (the listener's monitor task) drives ingest via
    /// [`Session::deliver_input`] and ticks via the returned sender.
    pub(crate) fn new_server(
        conv: u32,
        mode: Profile,
        socket: Arc<UdpSocket>,
        local: SocketAddr,
        remote: SocketAddr,
        codec: Option<Arc<Codec>>,
        dead_tx: mpsc::Sender<SocketAddr>,
    ) -> (Session, mpsc::Sender<u32>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(snd_wnd_capacity(mode));
        let engine = build_engine(conv, mode, codec.as_deref(), outbound_tx);

        let inner = Arc::new(Inner {
            engine: AsyncMutex::new(engine),
            conv,
            local,
            remote,
            codec,
            read_wake: Notify::new(),
            die: Notify::new(),
            closed: AtomicBool::new(false),
            needs_update: AtomicBool::new(true),
            next_update: AtomicU32::new(0),
            residual: StdMutex::new(Vec::new()),
            read_deadline: StdMutex::new(None),
            reclaim: Some((dead_tx.clone(), remote)),
        });

        let (tick_tx, tick_rx) = mpsc::channel(1);

        tokio::spawn(run_emit(inner.clone(), socket, outbound_rx));
        tokio::spawn(run_server_tick(inner.clone(), tick_rx, remote, dead_tx));

        (Session { inner }, tick_tx)
    }

    /// Feeds one already-decrypted datagram into the engine. Used by the
    /// listener's monitor task in place of a per-session ingest loop.
    pub(crate) async fn deliver_input(&self, buf: &[u8]) {
        let outcome = {
            let mut engine = self.inner.engine.lock().await;
            engine.input(buf)
        };
        self.inner.needs_update.store(true, Ordering::Release);
        if outcome == InputOutcome::NewData {
            self.inner.read_wake.notify_one();
        }
    }

    pub fn conv(&self) -> u32 {
        self.inner.conv
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote
    }

    /// Reads into `buf`. Serves from a residual buffer left over by a
    /// previous partial read before consulting the engine; blocks until data
    /// is available, the read deadline elapses, or the session closes.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        loop {
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(Error::BrokenPipe);
            }

            {
                let mut residual = self.inner.residual.lock().unwrap();
                if !residual.is_empty() {
                    let n = buf.len().min(residual.len());
                    buf[..n].copy_from_slice(&residual[..n]);
                    residual.drain(..n);
                    return Ok(n);
                }
            }

            let deadline = *self.inner.read_deadline.lock().unwrap();
            if let Some(dl) = deadline {
                if Instant::now() >= dl {
                    return Err(Error::Timeout);
                }
            }

            let mut message = Vec::new();
            let got_message = {
                let mut engine = self.inner.engine.lock().await;
                if engine.peek_size().is_some() {
                    engine.recv(&mut message).is_ok()
                } else {
                    false
                }
            };

            if got_message {
                let n = buf.len().min(message.len());
                buf[..n].copy_from_slice(&message[..n]);
                if n < message.len() {
                    self.inner.residual.lock().unwrap().extend_from_slice(&message[n..]);
                }
                return Ok(n);
            }

            let retry = deadline
                .map(|dl| dl.saturating_duration_since(Instant::now()).min(Duration::from_secs(1)))
                .unwrap_or(Duration::from_secs(1));

            tokio::select! {
                _ = self.inner.read_wake.notified() => {}
                _ = tokio::time::sleep(retry) => {}
                _ = self.inner.die.notified() => return Err(Error::BrokenPipe),
            }
        }
    }

    /// Segments `buf` into chunks of at most `mss * min(snd_wnd, 255)` bytes
    /// and offers each to the engine's send queue. Write deadlines are
    /// accepted for API symmetry but not enforced (spec.md §9 open question,
    /// resolved in DESIGN.md: always-succeeds-or-errors-on-close).
    pub async fn write(&self, buf: &[u8]) -> Result<usize, Error> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::BrokenPipe);
        }

        let chunk_size = {
            let engine = self.inner.engine.lock().await;
            engine.mss() * (engine.snd_wnd() as usize).min(255)
        }
        .max(1);

        let mut written = 0usize;
        for chunk in buf.chunks(chunk_size) {
            let mut engine = self.inner.engine.lock().await;
            engine.send(chunk).map_err(|e| Error::InvalidConfiguration(e.to_string()))?;
            written += chunk.len();
        }

        self.inner.needs_update.store(true, Ordering::Release);
        Ok(written)
    }

    /// Idempotent close: the first call tears down the session's tasks by
    /// notifying `die`; subsequent calls return `BrokenPipe`.
    pub fn close(&self) -> Result<(), Error> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::BrokenPipe);
        }
        self.inner.die.notify_waiters();
        if let Some((dead_tx, remote)) = &self.inner.reclaim {
            let _ = dead_tx.try_send(*remote);
        }
        Ok(())
    }

    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        *self.inner.read_deadline.lock().unwrap() = deadline;
    }

    /// Accepted but ignored: spec.md §4.2 "Write deadline is not enforced".
    pub fn set_write_deadline(&self, _deadline: Option<Instant>) {}

    pub async fn set_window_size(&self, snd: u16, rcv: u16) {
        self.inner.engine.lock().await.set_wnd_size(snd, rcv);
    }

    pub async fn set_mtu(&self, mtu: usize) -> Result<(), Error> {
        let effective = if self.inner.codec.is_some() {
            mtu.saturating_sub(crate::crypto::OVERHEAD)
        } else {
            mtu
        };
        self.inner
            .engine
            .lock()
            .await
            .set_mtu(effective)
            .map_err(|e| Error::InvalidConfiguration(e.to_string()))
    }

    pub async fn set_retries(&self, dead_link: u32) {
        self.inner.engine.lock().await.set_dead_link(dead_link);
    }
}

fn snd_wnd_capacity(mode: Profile) -> usize {
    // The default send window (32 segments) plus a little slop so the
    // engine's flush rarely blocks on a full channel; see spec.md §9.
    let base = match mode {
        Profile::Default | Profile::Normal | Profile::Fast => 32,
    };
    base + OUTBOUND_CHANNEL_SLOP
}

fn build_engine(
    conv: u32,
    mode: Profile,
    codec: Option<&Codec>,
    outbound_tx: mpsc::Sender<Vec<u8>>,
) -> Engine {
    let mut engine = Engine::new(conv, move |bytes: &[u8]| {
        if outbound_tx.try_send(bytes.to_vec()).is_err() {
            debug!("outbound channel full, dropping a flush buffer (treated as UDP loss)");
        }
    });
    engine.set_nodelay(mode.params());
    if codec.is_some() {
        // Reserve room for the obfuscation framing so wire datagrams still
        // fit the configured MTU. See spec.md §6 "Obfuscation overhead".
        let mtu = arq_core::config::DEFAULT_MTU - crate::crypto::OVERHEAD;
        let _ = engine.set_mtu(mtu);
    }
    engine
}

async fn run_emit(inner: Arc<Inner>, socket: Arc<UdpSocket>, mut outbound_rx: mpsc::Receiver<Vec<u8>>) {
    loop {
        tokio::select! {
            maybe_buf = outbound_rx.recv() => {
                let Some(buf) = maybe_buf else { break };
                let wire = match &inner.codec {
                    Some(codec) => codec.encrypt(&buf, rand::random()),
                    None => buf,
                };
                if let Err(e) = socket.send_to(&wire, inner.remote).await {
                    debug!(error = %e, remote = %inner.remote, "outbound send failed, dropping datagram");
                }
            }
            _ = inner.die.notified() => break,
        }
    }
}

async fn run_client_ingest(inner: Arc<Inner>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; 65536];
    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((n, addr)) if addr == inner.remote => {
                        handle_inbound(&inner, &buf[..n]).await;
                    }
                    Ok((_, addr)) => {
                        debug!(%addr, expected = %inner.remote, "dropping datagram from unexpected sender");
                    }
                    Err(e) => {
                        debug!(error = %e, "client socket recv error");
                    }
                }
            }
            _ = inner.die.notified() => break,
        }
    }
}

async fn handle_inbound(inner: &Arc<Inner>, raw: &[u8]) {
    let plaintext = match &inner.codec {
        Some(codec) => match codec.decrypt(raw) {
            Some(p) => p,
            None => {
                debug!("dropping datagram that failed the obfuscation checksum");
                return;
            }
        },
        None => raw.to_vec(),
    };
    if plaintext.len() < arq_core::HEADER_SIZE {
        debug!(len = plaintext.len(), "dropping undersized datagram");
        return;
    }

    let outcome = {
        let mut engine = inner.engine.lock().await;
        engine.input(&plaintext)
    };
    inner.needs_update.store(true, Ordering::Release);
    if outcome == InputOutcome::NewData {
        inner.read_wake.notify_one();
    }
}

async fn run_client_tick(inner: Arc<Inner>) {
    let start = Instant::now();
    let mut ticker = tokio::time::interval(Duration::from_millis(10));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = inner.die.notified() => break,
        }
        let now = start.elapsed().as_millis() as u32;
        if !tick_once(&inner, now).await {
            break;
        }
    }
}

async fn run_server_tick(
    inner: Arc<Inner>,
    mut tick_rx: mpsc::Receiver<u32>,
    remote: SocketAddr,
    dead_tx: mpsc::Sender<SocketAddr>,
) {
    loop {
        tokio::select! {
            maybe_now = tick_rx.recv() => {
                let Some(now) = maybe_now else { break };
                if !tick_once(&inner, now).await {
                    let _ = dead_tx.try_send(remote);
                    break;
                }
            }
            _ = inner.die.notified() => break,
        }
    }
}

/// Runs one tick: calls `Update`/`Check` if due, per spec.md §4.2 "Tick".
/// Returns `false` if the engine has gone dead (the caller should close).
async fn tick_once(inner: &Arc<Inner>, now: u32) -> bool {
    let pending = inner.needs_update.swap(false, Ordering::AcqRel);
    let due = mod_geq(now, inner.next_update.load(Ordering::Acquire));

    if pending || due {
        let mut engine = inner.engine.lock().await;
        engine.update(now);
        let next = engine.check(now);
        let dead = engine.is_dead();
        drop(engine);
        inner.next_update.store(next, Ordering::Release);

        if dead {
            if !inner.closed.swap(true, Ordering::AcqRel) {
                debug!(conv = inner.conv, "session closing: dead link");
                inner.die.notify_waiters();
            }
            return false;
        }
    }
    true
}
