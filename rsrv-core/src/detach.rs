//! Session detachment: park an authenticated session on a fresh listener
//! and resume it on whichever client reconnects with the right key
//! (component C6, spec §4.6).

use crate::net::bind_tcp_listener;
use rand::RngCore;
use std::io;
use std::net::{IpAddr, SocketAddr};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

/// Ports tried for the detach listener (spec §4.6 item 3).
const PORT_RANGE: std::ops::RangeInclusive<u16> = 32768..=65000;

pub const SESSION_KEY_LEN: usize = 32;

pub struct DetachHandoff {
    pub listener: TcpListener,
    pub port: u16,
    pub key: [u8; SESSION_KEY_LEN],
}

/// Bind the detach listener on a random free port in [`PORT_RANGE`],
/// retrying on `EADDRINUSE`, and generate the session key.
pub async fn prepare(bind_ip: IpAddr) -> io::Result<DetachHandoff> {
    let mut key = [0u8; SESSION_KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);

    let mut last_err = None;
    for _ in 0..64 {
        let port = {
            let span = (*PORT_RANGE.end() - *PORT_RANGE.start()) as u32 + 1;
            *PORT_RANGE.start() + (rand::thread_rng().next_u32() % span) as u16
        };
        let addr = SocketAddr::new(bind_ip, port);
        match bind_tcp_listener(addr) {
            Ok(listener) => return Ok(DetachHandoff { listener, port, key }),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                last_err = Some(e);
                continue;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::other("no free port found for detach listener")))
}

/// Block accepting on the detach listener until a client from `peer_ip`
/// presents the correct session key (spec §4.6 item 5). Mismatched peers
/// or keys are rejected without affecting any other connection.
pub async fn await_resume(
    listener: TcpListener,
    peer_ip: IpAddr,
    key: &[u8; SESSION_KEY_LEN],
) -> io::Result<TcpStream> {
    loop {
        let (mut stream, addr) = listener.accept().await?;
        if addr.ip() != peer_ip {
            warn!(%addr, expected = %peer_ip, "detach resume from unexpected peer, rejecting");
            drop(stream);
            continue;
        }
        let mut presented = [0u8; SESSION_KEY_LEN];
        if stream.read_exact(&mut presented).await.is_err() {
            continue;
        }
        if &presented != key {
            warn!(%addr, "detach resume with wrong session key, rejecting");
            let _ = stream.shutdown().await;
            continue;
        }
        info!(%addr, "session resumed after detach");
        return Ok(stream);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn prepare_binds_a_port_in_range() {
        let handoff = prepare(IpAddr::from([127, 0, 0, 1])).await.unwrap();
        assert!(PORT_RANGE.contains(&handoff.port));
    }

    #[tokio::test]
    async fn await_resume_rejects_wrong_key_then_accepts_right_one() {
        let handoff = prepare(IpAddr::from([127, 0, 0, 1])).await.unwrap();
        let port = handoff.port;
        let key = handoff.key;

        let resume_task =
            tokio::spawn(async move { await_resume(handoff.listener, IpAddr::from([127, 0, 0, 1]), &key).await });

        let mut bad = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        bad.write_all(&[0u8; SESSION_KEY_LEN]).await.unwrap();

        let mut good = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        good.write_all(&key).await.unwrap();

        let resumed = resume_task.await.unwrap().unwrap();
        assert_eq!(resumed.peer_addr().unwrap().ip(), IpAddr::from([127, 0, 0, 1]));
    }
}
