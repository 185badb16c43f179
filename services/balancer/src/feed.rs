//! Service update feed.
//!
//! Reads newline-delimited JSON deliveries. Each line is one
//! [`ServiceUpdate`] or an array of them applied together.

use std::io;

use ferry_model::{parse_delivery, ServiceUpdate};
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::UpdateSource;

/// A boxed line source.
pub type FeedReader = Box<dyn AsyncBufRead + Unpin + Send>;

/// Open the configured update source.
pub async fn open_feed(source: &UpdateSource) -> io::Result<FeedReader> {
    match source {
        UpdateSource::Stdin => Ok(Box::new(BufReader::new(tokio::io::stdin()))),
        UpdateSource::File(path) => {
            let file = File::open(path).await?;
            Ok(Box::new(BufReader::new(file)))
        }
    }
}

/// Forward deliveries from `reader` into `tx` until EOF.
///
/// Malformed lines are logged and skipped. Stops early when the receiver
/// is gone. Returns the number of deliveries sent.
pub async fn read_updates<R>(reader: R, tx: mpsc::Sender<Vec<ServiceUpdate>>) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut line_no = 0usize;
    let mut sent = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let delivery = match parse_delivery(line) {
            Ok(delivery) => delivery,
            Err(e) => {
                warn!(line = line_no, error = %e, "Skipping malformed update");
                continue;
            }
        };

        debug!(line = line_no, updates = delivery.len(), "Read delivery");
        if tx.send(delivery).await.is_err() {
            debug!("Update receiver closed, stopping feed");
            break;
        }
        sent += 1;
    }

    info!(deliveries = sent, "Update feed ended");
    Ok(sent)
}
