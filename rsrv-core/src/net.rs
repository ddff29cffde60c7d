//! Socket construction shared by the main listener and the detach/resume
//! listener (spec §4.7: `SO_REUSEADDR`, `listen(backlog=16)`).

use socket2::{Domain, Socket, Type};
use std::net::SocketAddr;
use tokio::net::TcpListener;

/// Fixed accept backlog used by both the main and detach listeners
/// (spec §4.7, §4.6 item 3: `LISTENQ`).
pub const LISTENQ: i32 = 16;

/// Bind a `SO_REUSEADDR` TCP listener with a fixed backlog of
/// [`LISTENQ`], non-blocking and ready to hand to tokio.
pub fn bind_tcp_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTENQ)?;
    TcpListener::from_std(socket.into())
}
