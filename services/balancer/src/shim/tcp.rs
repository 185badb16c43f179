//! Byte-level TCP relay.

use std::future::Future;
use std::io;
use std::net::Shutdown;

use socket2::SockRef;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

const BUF_SIZE: usize = 8192;

/// Relay bytes between `inbound` and `outbound` until both directions end.
///
/// When one side stops sending, the write side of the other connection is
/// shut down so the peer sees EOF while the opposite direction keeps
/// flowing. Both sockets are closed on return.
///
/// Returns `(bytes_to_outbound, bytes_to_inbound)`. If both directions
/// fail, the error of the copy into `outbound` wins.
pub async fn tcp_shim(inbound: TcpStream, outbound: TcpStream) -> io::Result<(u64, u64)> {
    let (in_read, in_write) = inbound.into_split();
    let (out_read, out_write) = outbound.into_split();

    join_directions(copy_half(in_read, out_write), copy_half(out_read, in_write)).await
}

/// Run both copies to completion and combine their results.
///
/// The error of `to_outbound` is returned before that of `to_inbound`,
/// whichever failed first.
async fn join_directions<A, B>(to_outbound: A, to_inbound: B) -> io::Result<(u64, u64)>
where
    A: Future<Output = io::Result<u64>>,
    B: Future<Output = io::Result<u64>>,
{
    let (to_outbound, to_inbound) = tokio::join!(to_outbound, to_inbound);
    Ok((to_outbound?, to_inbound?))
}

/// Copy `src` into `dst`, then half-close both.
async fn copy_half(mut src: OwnedReadHalf, mut dst: OwnedWriteHalf) -> io::Result<u64> {
    let mut total = 0u64;
    let mut buf = vec![0u8; BUF_SIZE];

    let result = loop {
        match src.read(&mut buf).await {
            Ok(0) => break Ok(total),
            Ok(n) => {
                if let Err(e) = dst.write_all(&buf[..n]).await {
                    break Err(e);
                }
                total += n as u64;
            }
            Err(e) => break Err(e),
        }
    };

    // The peer may already be gone; nothing useful to do about it here.
    let _ = dst.shutdown().await;
    let stream: &TcpStream = src.as_ref();
    let _ = SockRef::from(stream).shutdown(Shutdown::Read);

    result
}
