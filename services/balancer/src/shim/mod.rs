//! Protocol shims: how one forwarded connection is relayed.

mod http;
mod tcp;

use std::io;
use std::sync::Arc;

use ferry_model::{ConnectionEvent, EventSink, Protocol};
use tokio::net::TcpStream;
use tracing::{debug, warn};

pub use http::http_shim;
pub use tcp::tcp_shim;

/// Relay `inbound` to `outbound` with the shim for `conn.protocol`.
///
/// Unknown protocol tags are relayed as plain TCP.
pub async fn relay(
    inbound: TcpStream,
    outbound: TcpStream,
    conn: ConnectionEvent,
    sink: Arc<dyn EventSink>,
) -> io::Result<()> {
    match &conn.protocol {
        Protocol::Http => http_shim(inbound, outbound, conn, sink).await,
        Protocol::Tcp => relay_tcp(inbound, outbound).await,
        Protocol::Unknown(tag) => {
            warn!(service = %conn.service, protocol = %tag, "Unknown protocol, relaying as TCP");
            relay_tcp(inbound, outbound).await
        }
    }
}

async fn relay_tcp(inbound: TcpStream, outbound: TcpStream) -> io::Result<()> {
    let (to_outbound, to_inbound) = tcp_shim(inbound, outbound).await?;
    debug!(
        bytes_to_instance = to_outbound,
        bytes_from_instance = to_inbound,
        "Connection closed"
    );
    Ok(())
}
