//! The backend's event feed: `GET /api/events`, one JSON event per line.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use autoboard_core::event::{decode_event, AutoModeEvent};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{info, warn};

use crate::HttpGateway;

const MIN_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Longest line the decoder will hold while waiting for its newline.
pub const MAX_LINE_BYTES: usize = 1 << 20;

/// Splits a byte stream into lines and decodes each one. Partial lines are
/// held until the rest arrives; malformed lines are skipped. A line longer
/// than the cap is dropped up to its newline.
#[derive(Debug)]
pub struct NdjsonDecoder {
    buf: Vec<u8>,
    max_line: usize,
    /// Inside an oversized line: discard until the next newline.
    skipping: bool,
}

impl Default for NdjsonDecoder {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_line,
            skipping: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<AutoModeEvent> {
        let mut chunk = chunk;
        if self.skipping {
            match chunk.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    self.skipping = false;
                    chunk = &chunk[pos + 1..];
                }
                None => return Vec::new(),
            }
        }
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(ev) = decode_event(&String::from_utf8_lossy(&line)) {
                events.push(ev);
            }
        }
        if self.buf.len() > self.max_line {
            warn!(
                bytes = self.buf.len(),
                "event line exceeds {} bytes, dropping it", self.max_line
            );
            self.buf.clear();
            self.skipping = true;
        }
        events
    }

    /// Bytes waiting for a newline.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Keep the event feed connected, reconnecting with backoff, and publish every
/// event to the gateway's subscribers. Runs until aborted.
pub fn spawn_event_stream(gateway: &HttpGateway) -> JoinHandle<()> {
    let http = gateway.http().clone();
    let url = format!("{}/api/events", gateway.base_url());
    let tx = gateway.sender();
    tokio::spawn(async move {
        let mut backoff = MIN_BACKOFF;
        loop {
            match pump(&http, &url, &tx, &mut backoff).await {
                Ok(()) => warn!("event stream closed by backend"),
                Err(e) => warn!("event stream error: {e:#}"),
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    })
}

async fn pump(
    http: &reqwest::Client,
    url: &str,
    tx: &broadcast::Sender<AutoModeEvent>,
    backoff: &mut Duration,
) -> Result<()> {
    let mut response = http
        .get(url)
        .header("accept", "application/x-ndjson")
        .send()
        .await
        .with_context(|| format!("GET {url}"))?;
    if !response.status().is_success() {
        bail!("GET {url}: HTTP {}", response.status());
    }
    info!(url, "event stream connected");
    *backoff = MIN_BACKOFF;

    let mut decoder = NdjsonDecoder::new();
    while let Some(chunk) = response.chunk().await.context("read event stream")? {
        for event in decoder.push(&chunk) {
            // No subscribers yet is fine; the event is simply not needed.
            let _ = tx.send(event);
        }
    }
    Ok(())
}
