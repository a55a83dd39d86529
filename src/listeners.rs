//! Listeners (§4.5): the two non-blocking IPv4 TCP listening sockets.

use mio::net::TcpListener;
use socket2::{Domain, Socket, Type};
use std::net::SocketAddr;

use crate::error::EngineError;

/// Backlog used for both listening sockets (§4.5).
const BACKLOG: i32 = 10;

/// Binds a non-blocking IPv4 TCP listener on `port` with `SO_REUSEADDR` and
/// a backlog of 10, matching §4.5 exactly (the std-only `TcpListener::bind`
/// doesn't expose backlog control, hence `socket2` for the raw socket
/// setup).
pub fn bind_listener(port: u16) -> Result<TcpListener, EngineError> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None)
        .and_then(|s| {
            s.set_reuse_address(true)?;
            s.set_nonblocking(true)?;
            s.bind(&addr.into())?;
            s.listen(BACKLOG)?;
            Ok(s)
        })
        .map_err(|e| EngineError::BindFailed(addr, e))?;

    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener))
}
