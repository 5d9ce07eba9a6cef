//! Output multiplexing.
//!
//! Each opened session gets a drain task that turns its byte stream into
//! [`OutputLine`]s tagged with the host name. All drains feed one channel,
//! which a single printer writes out. Lines of one host keep their order.
//! Lines of different hosts interleave freely.

use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Capacity of each host's byte channel.
pub const BYTES_CHANNEL_CAPACITY: usize = 64;

/// Capacity of the shared line channel.
pub const LINES_CHANNEL_CAPACITY: usize = 1024;

/// One line of remote output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub host: Arc<str>,
    pub text: String,
}

impl fmt::Display for OutputLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.host, self.text)
    }
}

/// Splits a byte stream into lines.
///
/// Lines have no length limit. A trailing `\r` is stripped and invalid UTF-8
/// is replaced.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning every line they complete.
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = data;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            self.buf.extend_from_slice(&rest[..pos]);
            lines.push(self.take_line());
            rest = &rest[pos + 1..];
        }
        self.buf.extend_from_slice(rest);
        lines
    }

    /// The final unterminated line, if any.
    pub fn finish(mut self) -> Option<String> {
        if self.buf.is_empty() {
            None
        } else {
            Some(self.take_line())
        }
    }

    fn take_line(&mut self) -> String {
        if self.buf.last() == Some(&b'\r') {
            self.buf.pop();
        }
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        line
    }
}

/// Decode one host's byte stream onto the shared line channel.
///
/// Returns when the byte stream ends or the line channel is closed. Returns
/// the number of lines delivered.
pub async fn drain(
    host: Arc<str>,
    mut bytes: mpsc::Receiver<Vec<u8>>,
    lines: mpsc::Sender<OutputLine>,
) -> usize {
    let mut decoder = LineDecoder::new();
    let mut sent = 0;

    while let Some(chunk) = bytes.recv().await {
        for text in decoder.push(&chunk) {
            let line = OutputLine {
                host: host.clone(),
                text,
            };
            if lines.send(line).await.is_err() {
                debug!(host = %host, "Output channel closed, dropping output");
                return sent;
            }
            sent += 1;
        }
    }

    if let Some(text) = decoder.finish() {
        if lines.send(OutputLine { host, text }).await.is_ok() {
            sent += 1;
        }
    }
    sent
}

/// Write every line from `rx` to `out` as `[host] text`.
///
/// Returns once all senders are gone. Returns the number of lines written.
pub async fn print_lines<W>(mut rx: mpsc::Receiver<OutputLine>, mut out: W) -> io::Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    while let Some(line) = rx.recv().await {
        out.write_all(format!("{}\n", line).as_bytes()).await?;
        // One host's output should show up while others are still silent.
        if rx.is_empty() {
            out.flush().await?;
        }
        written += 1;
    }
    out.flush().await?;
    Ok(written)
}

/// Wait for a spawned [`print_lines`] task unless `interrupt` fires first.
///
/// On interrupt the printer is aborted and `None` is returned.
pub async fn finish_printing<F>(
    mut printer: JoinHandle<io::Result<usize>>,
    interrupt: F,
) -> Option<io::Result<usize>>
where
    F: Future<Output = ()>,
{
    tokio::select! {
        biased;

        _ = interrupt => {
            printer.abort();
            None
        }

        joined = &mut printer => Some(joined.unwrap_or_else(|e| Err(io::Error::other(e)))),
    }
}
