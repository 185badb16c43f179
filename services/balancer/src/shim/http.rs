//! HTTP/1.x exchange relay.
//!
//! Two loops share one connection pair. The request loop reads a request
//! from the client and writes it to the instance; the response loop reads
//! the matching response, writes it back and reports the exchange. A
//! single-slot channel hands each written request to the response loop,
//! so the next request is not read before the previous one is dispatched.
//!
//! A request with `Expect: 100-continue` is handed over as soon as its head
//! is written, so the interim response reaches the client before the body
//! is sent. After a `101` to an upgrade request both loops stop parsing and
//! copy raw bytes until each side closes.

use std::io;
use std::sync::Arc;
use std::time::Instant;

use ferry_model::{ConnectionEvent, EventSink, HttpExchangeEvent};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

/// Largest accepted request or response head.
const MAX_HEAD_LEN: usize = 64 * 1024;

/// Largest accepted chunk-size or trailer line.
const MAX_LINE_LEN: usize = 4096;

const MAX_HEADERS: usize = 100;

/// How a message body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyFraming {
    Empty,
    Length(u64),
    Chunked,
    UntilClose,
}

/// What the relay needs from a request head.
#[derive(Debug)]
struct RequestHead {
    method: String,
    url: String,
    framing: BodyFraming,
    expect_continue: bool,
    upgrade: bool,
}

/// A request written to the instance, waiting for its response.
#[derive(Debug)]
struct Pending {
    method: String,
    url: String,
    written_at: Instant,
    /// Upgrade requests only: told whether the instance switched protocols.
    switched: Option<oneshot::Sender<bool>>,
}

/// Relay HTTP exchanges between `inbound` and `outbound`.
///
/// Each completed exchange is reported to `sink`. A clean end of the
/// request stream ends the relay without error; any other failure on
/// either side ends it with that error.
pub async fn http_shim(
    inbound: TcpStream,
    outbound: TcpStream,
    conn: ConnectionEvent,
    sink: Arc<dyn EventSink>,
) -> io::Result<()> {
    let (in_read, in_write) = inbound.into_split();
    let (out_read, out_write) = outbound.into_split();
    let (tx, rx) = mpsc::channel::<Pending>(1);

    tokio::try_join!(
        forward_requests(BufReader::new(in_read), out_write, tx),
        relay_responses(BufReader::new(out_read), in_write, rx, conn, sink),
    )?;
    Ok(())
}

async fn forward_requests(
    mut client: BufReader<OwnedReadHalf>,
    mut instance: OwnedWriteHalf,
    tx: mpsc::Sender<Pending>,
) -> io::Result<()> {
    while let Some(head) = read_head(&mut client).await? {
        let request = parse_request(&head)?;
        instance.write_all(&head).await?;

        let (switched_tx, switched_rx) = if request.upgrade {
            let (switched_tx, switched_rx) = oneshot::channel();
            (Some(switched_tx), Some(switched_rx))
        } else {
            (None, None)
        };
        let mut pending = Some(Pending {
            method: request.method,
            url: request.url,
            written_at: Instant::now(),
            switched: switched_tx,
        });

        if request.expect_continue {
            instance.flush().await?;
            if !hand_off(&tx, &mut pending).await {
                break;
            }
        }
        copy_body(&mut client, &mut instance, request.framing).await?;
        instance.flush().await?;
        if !hand_off(&tx, &mut pending).await {
            break;
        }

        if let Some(switched) = switched_rx {
            // A dropped sender means the response was not a 101.
            if switched.await.unwrap_or(false) {
                tokio::io::copy_buf(&mut client, &mut instance).await?;
                instance.shutdown().await?;
                return Ok(());
            }
        }
    }
    Ok(())
}

/// Pass `pending` to the response loop, stamped now.
///
/// Returns false once the response loop has finished with the connection.
async fn hand_off(tx: &mpsc::Sender<Pending>, pending: &mut Option<Pending>) -> bool {
    let Some(mut pending) = pending.take() else {
        return true;
    };
    pending.written_at = Instant::now();
    tx.send(pending).await.is_ok()
}

async fn relay_responses(
    mut instance: BufReader<OwnedReadHalf>,
    mut client: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Pending>,
    conn: ConnectionEvent,
    sink: Arc<dyn EventSink>,
) -> io::Result<()> {
    while let Some(mut pending) = rx.recv().await {
        let head_only = pending.method.eq_ignore_ascii_case("HEAD");
        loop {
            let head = read_head(&mut instance).await?.ok_or_else(|| {
                io::Error::new(io::ErrorKind::UnexpectedEof, "instance closed before responding")
            })?;
            let round_trip = pending.written_at.elapsed();
            let (status, framing) = parse_response(&head, head_only)?;

            client.write_all(&head).await?;
            copy_body(&mut instance, &mut client, framing).await?;
            client.flush().await?;

            // Interim responses precede the final one.
            if (100..200).contains(&status) && status != 101 {
                continue;
            }

            sink.http_exchange(HttpExchangeEvent {
                connection: conn.clone(),
                method: pending.method.clone(),
                url: pending.url.clone(),
                status,
                round_trip,
                total: pending.written_at.elapsed(),
            });

            if status == 101 {
                let Some(switched) = pending.switched.take() else {
                    return Err(invalid("101 response to a request without Upgrade"));
                };
                let _ = switched.send(true);
                tokio::io::copy_buf(&mut instance, &mut client).await?;
                client.shutdown().await?;
                return Ok(());
            }
            if framing == BodyFraming::UntilClose {
                client.shutdown().await?;
                return Ok(());
            }
            break;
        }
    }
    Ok(())
}

/// Read a message head up to and including the blank line.
///
/// Returns `None` on EOF before any byte of a new message. Blank lines
/// before a message are skipped.
async fn read_head<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::new();
    loop {
        let remaining = MAX_HEAD_LEN.saturating_sub(head.len());
        if remaining == 0 {
            return Err(invalid("message head too large"));
        }

        let start = head.len();
        let n = (&mut *reader)
            .take(remaining as u64)
            .read_until(b'\n', &mut head)
            .await?;
        if n == 0 {
            if head.is_empty() {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside message head",
            ));
        }

        let line = &head[start..];
        if !line.ends_with(b"\n") {
            continue;
        }
        if line == b"\r\n" || line == b"\n" {
            if start == 0 {
                head.clear();
                continue;
            }
            return Ok(Some(head));
        }
    }
}

fn parse_request(head: &[u8]) -> io::Result<RequestHead> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => return Err(invalid("incomplete request head")),
        Err(e) => return Err(invalid(&format!("malformed request head: {}", e))),
    }

    let expect_continue = req.headers.iter().any(|h| {
        h.name.eq_ignore_ascii_case("expect")
            && String::from_utf8_lossy(h.value)
                .trim()
                .eq_ignore_ascii_case("100-continue")
    });
    let upgrade = req
        .headers
        .iter()
        .any(|h| h.name.eq_ignore_ascii_case("upgrade"));

    Ok(RequestHead {
        method: req.method.unwrap_or_default().to_string(),
        url: req.path.unwrap_or_default().to_string(),
        framing: declared_framing(req.headers)?.unwrap_or(BodyFraming::Empty),
        expect_continue,
        upgrade,
    })
}

fn parse_response(head: &[u8], head_only: bool) -> io::Result<(u16, BodyFraming)> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);
    match resp.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => return Err(invalid("incomplete response head")),
        Err(e) => return Err(invalid(&format!("malformed response head: {}", e))),
    }

    let status = resp.code.unwrap_or_default();
    let bodyless = head_only || (100..200).contains(&status) || status == 204 || status == 304;
    let framing = if bodyless {
        BodyFraming::Empty
    } else {
        declared_framing(resp.headers)?.unwrap_or(BodyFraming::UntilClose)
    };
    Ok((status, framing))
}

/// Framing named by the headers, if any. Chunked wins over a length.
fn declared_framing(headers: &[httparse::Header<'_>]) -> io::Result<Option<BodyFraming>> {
    let mut length = None;
    for header in headers {
        if header.name.eq_ignore_ascii_case("transfer-encoding") {
            let value = String::from_utf8_lossy(header.value);
            let last = value.rsplit(',').next().unwrap_or_default().trim();
            if last.eq_ignore_ascii_case("chunked") {
                return Ok(Some(BodyFraming::Chunked));
            }
        } else if header.name.eq_ignore_ascii_case("content-length") {
            let n = std::str::from_utf8(header.value)
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .ok_or_else(|| invalid("invalid Content-Length"))?;
            length = Some(n);
        }
    }
    Ok(length.map(BodyFraming::Length))
}

async fn copy_body<R, W>(reader: &mut R, writer: &mut W, framing: BodyFraming) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match framing {
        BodyFraming::Empty => Ok(()),
        BodyFraming::Length(len) => copy_exact(reader, writer, len).await,
        BodyFraming::UntilClose => {
            tokio::io::copy_buf(reader, writer).await?;
            Ok(())
        }
        BodyFraming::Chunked => loop {
            let size_line = read_line(reader).await?;
            writer.write_all(&size_line).await?;
            let size = chunk_size(&size_line)?;

            if size == 0 {
                // Trailer section, ended by a blank line.
                loop {
                    let line = read_line(reader).await?;
                    writer.write_all(&line).await?;
                    if line == b"\r\n" || line == b"\n" {
                        return Ok(());
                    }
                }
            }

            copy_exact(reader, writer, size).await?;
            let crlf = read_line(reader).await?;
            if crlf != b"\r\n" && crlf != b"\n" {
                return Err(invalid("missing CRLF after chunk data"));
            }
            writer.write_all(&crlf).await?;
        },
    }
}

async fn copy_exact<R, W>(reader: &mut R, writer: &mut W, len: u64) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::io::copy_buf(&mut (&mut *reader).take(len), writer).await?;
    if copied < len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed inside message body",
        ));
    }
    Ok(())
}

async fn read_line<R>(reader: &mut R) -> io::Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    (&mut *reader)
        .take(MAX_LINE_LEN as u64)
        .read_until(b'\n', &mut line)
        .await?;
    if line.ends_with(b"\n") {
        return Ok(line);
    }
    if line.len() >= MAX_LINE_LEN {
        return Err(invalid("chunk line too long"));
    }
    Err(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "connection closed inside chunked body",
    ))
}

fn chunk_size(line: &[u8]) -> io::Result<u64> {
    let text = std::str::from_utf8(line).map_err(|_| invalid("chunk size is not ASCII"))?;
    let digits = text.split(';').next().unwrap_or_default().trim();
    u64::from_str_radix(digits, 16).map_err(|_| invalid("invalid chunk size"))
}

fn invalid(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_string())
}
