//! Test harness for balancer integration tests.
//!
//! Provides loopback backends, an in-memory packet filter, and helpers to
//! find where a virtual address is being steered.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

use ferry_balancer::{Balancer, BalancerContext, ErrorReporter, OperationalError, PoolConfig};
use ferry_model::{ChannelSink, Event, Instance, Service};
use ferry_netfilter::{ChainManager, MemoryInvoker, Table};

/// Backend that records everything each connection sends until EOF.
#[allow(dead_code)]
pub struct CaptureBackend {
    pub addr: SocketAddr,
    /// `(peer address, bytes received)` per finished connection.
    pub received: mpsc::UnboundedReceiver<(SocketAddr, Vec<u8>)>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl CaptureBackend {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (tx, received) = mpsc::unbounded_channel();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => match accept_result {
                        Ok((mut stream, peer)) => {
                            let tx = tx.clone();
                            tokio::spawn(async move {
                                let mut data = Vec::new();
                                if stream.read_to_end(&mut data).await.is_ok() {
                                    let _ = tx.send((peer, data));
                                }
                            });
                        }
                        Err(_) => break,
                    },
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            received,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for CaptureBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Minimal HTTP/1.1 backend: answers every request with its own path.
#[allow(dead_code)]
pub struct HttpBackend {
    pub addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl HttpBackend {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => match accept_result {
                        Ok((stream, _)) => {
                            tokio::spawn(serve_http(stream));
                        }
                        Err(_) => break,
                    },
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
        })
    }
}

impl Drop for HttpBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn serve_http(stream: TcpStream) {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    loop {
        let mut request_line = String::new();
        match reader.read_line(&mut request_line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        // Bodiless requests only; skip headers up to the blank line.
        loop {
            let mut header = String::new();
            match reader.read_line(&mut header).await {
                Ok(0) | Err(_) => return,
                Ok(_) if header == "\r\n" => break,
                Ok(_) => {}
            }
        }

        let path = request_line.split_whitespace().nth(1).unwrap_or("/").to_string();
        tokio::time::sleep(Duration::from_millis(1)).await;
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
            path.len(),
            path
        );
        if write.write_all(response.as_bytes()).await.is_err() {
            return;
        }
    }
}

/// An address nothing listens on.
#[allow(dead_code)]
pub async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// A balancer over an in-memory packet filter with chains installed.
#[allow(dead_code)]
pub struct TestBalancer {
    pub balancer: Balancer,
    pub filter: Arc<MemoryInvoker>,
    pub events: mpsc::UnboundedReceiver<Event>,
    pub errors: mpsc::UnboundedReceiver<OperationalError>,
}

#[allow(dead_code)]
impl TestBalancer {
    pub fn new() -> Self {
        let filter = Arc::new(MemoryInvoker::new());
        let (sink, events) = ChannelSink::new();
        let (errors, errors_rx) = ErrorReporter::new();

        let ctx = BalancerContext {
            netfilter: Arc::new(ChainManager::new(filter.clone(), "FERRY")),
            bridge_ip: "127.0.0.1".parse().unwrap(),
            pool_config: PoolConfig::default(),
            connect_timeout: Duration::from_millis(500),
            sink: Arc::new(sink),
            errors,
        };
        ctx.install_chains().unwrap();

        Self {
            balancer: Balancer::new(ctx),
            filter,
            events,
            errors: errors_rx,
        }
    }

    /// Where the DNAT rule for `vip` currently points.
    pub fn dnat_target(&self, vip: SocketAddr) -> Option<SocketAddr> {
        dnat_target(&self.filter, vip)
    }
}

/// Where the DNAT rule for `vip` in the managed chain points.
#[allow(dead_code)]
pub fn dnat_target(filter: &MemoryInvoker, vip: SocketAddr) -> Option<SocketAddr> {
    let matcher = format!("-d {} --dport {} ", vip.ip(), vip.port());
    filter
        .rules(Table::Nat, "FERRY")
        .iter()
        .filter(|rule| rule.contains(&matcher))
        .find_map(|rule| {
            let mut words = rule.split_whitespace();
            words.find(|w| *w == "--to-destination")?;
            words.next()?.parse().ok()
        })
}

/// True when a REJECT rule for `vip` is installed.
#[allow(dead_code)]
pub fn is_rejected(filter: &MemoryInvoker, vip: SocketAddr) -> bool {
    let matcher = format!("-d {} --dport {} ", vip.ip(), vip.port());
    filter
        .rules(Table::Filter, "FERRY")
        .iter()
        .any(|rule| rule.contains(&matcher) && rule.contains("-j REJECT"))
}

/// A service snapshot.
#[allow(dead_code)]
pub fn service(
    protocol: &str,
    vip: Option<SocketAddr>,
    instances: &[(&str, SocketAddr)],
) -> Service {
    Service {
        protocol: protocol.to_string(),
        address: vip,
        instances: instances
            .iter()
            .map(|(name, addr)| Instance::new(*name, *addr))
            .collect(),
    }
}

/// Poll `check` until it holds or `timeout` passes.
#[allow(dead_code)]
pub async fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
