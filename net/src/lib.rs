//! Binds the pure `arq-core` engine to real UDP sockets, `tokio` tasks, and
//! an optional per-datagram obfuscation codec. See spec.md §4.2-§4.4, §6.

pub mod crypto;
pub mod error;
pub mod listener;
pub mod session;

use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::sync::Arc;

use rand::Rng;
use tokio::net::{lookup_host, ToSocketAddrs, UdpSocket};

pub use arq_core::Profile as Mode;
pub use error::Error;
pub use listener::Listener;
pub use session::Session;

use crypto::Codec;

/// Ephemeral port range a dial binds into, retrying on collision. See
/// spec.md §6 "Dial/Listen surface".
const DIAL_PORT_RANGE: RangeInclusive<u16> = 20_000..=65_535;

/// Bound on bind-collision retries (spec.md §9 open question: dial port
/// allocation previously retried unboundedly).
const MAX_BIND_RETRIES: u32 = 256;

/// Dials `remote_address`, binding a random local UDP port and assigning a
/// random conversation id.
pub async fn dial(mode: Mode, remote_address: impl ToSocketAddrs) -> Result<Session, Error> {
    dial_inner(mode, remote_address, None).await
}

/// Like [`dial`], but wraps every outbound/inbound datagram with the
/// obfuscation codec keyed by `key`. See spec.md §4.4.
pub async fn dial_encrypted(
    mode: Mode,
    remote_address: impl ToSocketAddrs,
    key: &[u8],
) -> Result<Session, Error> {
    dial_inner(mode, remote_address, Some(Arc::new(Codec::new(key)))).await
}

async fn dial_inner(
    mode: Mode,
    remote_address: impl ToSocketAddrs,
    codec: Option<Arc<Codec>>,
) -> Result<Session, Error> {
    let remote = resolve_one(remote_address).await?;
    let socket = bind_ephemeral_port().await?;
    let local = socket.local_addr()?;
    let conv: u32 = rand::random();

    Ok(Session::new_client(conv, mode, socket, local, remote, codec))
}

/// Listens on `local_address` for inbound sessions.
pub async fn listen(mode: Mode, local_address: impl ToSocketAddrs) -> Result<Listener, Error> {
    let addr = resolve_one(local_address).await?;
    Listener::bind(mode, addr, None).await
}

/// Like [`listen`], but requires every inbound datagram to pass the
/// obfuscation codec keyed by `key` before it reaches a session.
pub async fn listen_encrypted(
    mode: Mode,
    local_address: impl ToSocketAddrs,
    key: &[u8],
) -> Result<Listener, Error> {
    let addr = resolve_one(local_address).await?;
    Listener::bind(mode, addr, Some(Arc::new(Codec::new(key)))).await
}

async fn resolve_one(address: impl ToSocketAddrs) -> Result<SocketAddr, Error> {
    lookup_host(address)
        .await
        .map_err(|e| Error::AddressResolutionFailed(e.to_string()))?
        .next()
        .ok_or_else(|| Error::AddressResolutionFailed("no addresses returned".to_string()))
}

async fn bind_ephemeral_port() -> Result<UdpSocket, Error> {
    let mut last_err = None;
    for _ in 0..MAX_BIND_RETRIES {
        let port = rand::thread_rng().gen_range(DIAL_PORT_RANGE);
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        match UdpSocket::bind(addr).await {
            Ok(socket) => return Ok(socket),
            Err(e) => last_err = Some(e),
        }
    }
    Err(Error::SocketBindFailed(Arc::new(last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::AddrInUse, "exhausted dial port retries")
    }))))
}
