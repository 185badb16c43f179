//! Relay events and the sinks that receive them.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::info;

use crate::types::{Instance, Protocol};

/// Emitted once per successful dial to an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    /// Service the connection was made for.
    pub service: String,
    /// Instance that was dialled.
    pub instance: Instance,
    /// Peer address of the intercepted client connection.
    pub inbound: SocketAddr,
    /// Address of the instance connection.
    pub outbound: SocketAddr,
    /// Protocol the connection is relayed with.
    pub protocol: Protocol,
}

/// Emitted once per completed HTTP request/response exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpExchangeEvent {
    pub connection: ConnectionEvent,
    pub method: String,
    pub url: String,
    pub status: u16,
    /// Request written to response head read.
    pub round_trip: Duration,
    /// Request written to response fully relayed.
    pub total: Duration,
}

/// Either kind of event, for channel-based consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connection(ConnectionEvent),
    HttpExchange(HttpExchangeEvent),
}

/// Receiver of relay events.
///
/// Called from connection tasks; implementations must not block.
pub trait EventSink: Send + Sync + 'static {
    fn connection(&self, event: ConnectionEvent);

    fn http_exchange(&self, event: HttpExchangeEvent);
}

/// Writes events as structured log lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn connection(&self, event: ConnectionEvent) {
        info!(
            service = %event.service,
            instance = %event.instance.name,
            inbound = %event.inbound,
            outbound = %event.outbound,
            protocol = %event.protocol,
            "Connection forwarded"
        );
    }

    fn http_exchange(&self, event: HttpExchangeEvent) {
        info!(
            service = %event.connection.service,
            instance = %event.connection.instance.name,
            inbound = %event.connection.inbound,
            method = %event.method,
            url = %event.url,
            status = event.status,
            round_trip_us = event.round_trip.as_micros() as u64,
            total_us = event.total.as_micros() as u64,
            "HTTP exchange"
        );
    }
}

/// Forwards events into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelSink {
    /// Create a sink and the receiver that drains it.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn connection(&self, event: ConnectionEvent) {
        // Receiver gone means nobody is listening any more.
        let _ = self.tx.send(Event::Connection(event));
    }

    fn http_exchange(&self, event: HttpExchangeEvent) {
        let _ = self.tx.send(Event::HttpExchange(event));
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn connection(&self, _event: ConnectionEvent) {}

    fn http_exchange(&self, _event: HttpExchangeEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ConnectionEvent {
        ConnectionEvent {
            service: "svc".to_string(),
            instance: Instance::new("svc-1", "127.0.0.1:9000".parse().unwrap()),
            inbound: "127.0.0.1:40000".parse().unwrap(),
            outbound: "127.0.0.1:9000".parse().unwrap(),
            protocol: Protocol::Tcp,
        }
    }

    #[tokio::test]
    async fn test_channel_sink_delivers_in_order() {
        let (sink, mut rx) = ChannelSink::new();
        sink.connection(sample());
        sink.http_exchange(HttpExchangeEvent {
            connection: sample(),
            method: "GET".to_string(),
            url: "/".to_string(),
            status: 200,
            round_trip: Duration::from_millis(1),
            total: Duration::from_millis(2),
        });

        assert!(matches!(rx.recv().await, Some(Event::Connection(_))));
        match rx.recv().await {
            Some(Event::HttpExchange(ev)) => assert_eq!(ev.status, 200),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_channel_sink_survives_closed_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.connection(sample());
    }
}
