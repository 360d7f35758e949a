use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

// Tunnels start with a small buffer; most CONNECT streams are short-lived
// TLS sessions. High-volume streams grow the buffer once past the threshold.
const INITIAL_BUFFER_SIZE: usize = 1024;
// TLS record max is 16k; stay just under it.
const LARGE_BUFFER_SIZE: usize = 16_384 - 64;
const RESIZE_THRESHOLD: u64 = 128 * 1024;

/// Live byte counters for one spliced tunnel. `sent` counts client→upstream
/// bytes, `received` counts upstream→client. The counters are updated as the
/// copy progresses so bandwidth accounting sees long-lived tunnels too.
#[derive(Debug, Default)]
pub struct SpliceCounters {
	pub sent: AtomicU64,
	pub received: AtomicU64,
}

impl SpliceCounters {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn totals(&self) -> (u64, u64) {
		(
			self.sent.load(Ordering::Relaxed),
			self.received.load(Ordering::Relaxed),
		)
	}
}

#[derive(thiserror::Error, Debug)]
pub enum SpliceError {
	#[error("client disconnected before all data was written")]
	ClientDisconnected,
	#[error("upstream disconnected before all data was written")]
	UpstreamDisconnected,
	#[error("io error: {0}")]
	Io(#[from] io::Error),
}

/// Splices bytes bidirectionally between `client` and `upstream` until either
/// side closes. The termination of one direction cancels the other: a tunnel
/// is dead once either peer is done with it.
pub async fn splice<A, B>(
	client: A,
	upstream: B,
	counters: &SpliceCounters,
) -> Result<(u64, u64), SpliceError>
where
	A: AsyncRead + AsyncWrite + Unpin,
	B: AsyncRead + AsyncWrite + Unpin,
{
	let (mut cr, mut cw) = io::split(client);
	let (mut ur, mut uw) = io::split(upstream);

	let send = copy_counted(&mut cr, &mut uw, &counters.sent);
	let recv = copy_counted(&mut ur, &mut cw, &counters.received);
	tokio::pin!(send);
	tokio::pin!(recv);

	let res = tokio::select! {
		r = &mut send => r.map_err(|e| translate(e, SpliceError::UpstreamDisconnected)),
		r = &mut recv => r.map_err(|e| translate(e, SpliceError::ClientDisconnected)),
	};

	let (sent, received) = counters.totals();
	trace!(sent, received, "splice complete");
	res.map(|_| (sent, received))
}

// A peer resetting or vanishing mid-tunnel is normal TCP life, not an error
// worth surfacing; only unexpected kinds propagate.
fn translate(e: io::Error, disconnected: SpliceError) -> SpliceError {
	use io::ErrorKind::*;
	match e.kind() {
		NotConnected | WriteZero => disconnected,
		UnexpectedEof | ConnectionReset | BrokenPipe => disconnected,
		_ => SpliceError::Io(e),
	}
}

async fn copy_counted<R, W>(reader: &mut R, writer: &mut W, counter: &AtomicU64) -> io::Result<u64>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
{
	let mut buf = vec![0u8; INITIAL_BUFFER_SIZE];
	let mut total: u64 = 0;
	loop {
		let n = reader.read(&mut buf).await?;
		if n == 0 {
			let _ = writer.shutdown().await;
			return Ok(total);
		}
		writer.write_all(&buf[..n]).await?;
		counter.fetch_add(n as u64, Ordering::Relaxed);
		let old = total;
		total += n as u64;
		if old < RESIZE_THRESHOLD && RESIZE_THRESHOLD <= total && buf.len() < LARGE_BUFFER_SIZE {
			buf.resize(LARGE_BUFFER_SIZE, 0);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn splice_moves_bytes_both_ways() {
		let (client, mut client_peer) = tokio::io::duplex(64);
		let (upstream, mut upstream_peer) = tokio::io::duplex(64);
		let counters = SpliceCounters::new();

		let counters2 = counters.clone();
		let handle = tokio::spawn(async move { splice(client, upstream, &counters2).await });

		client_peer.write_all(b"hello upstream").await.unwrap();
		client_peer.shutdown().await.unwrap();

		let mut got = vec![0u8; 14];
		upstream_peer.read_exact(&mut got).await.unwrap();
		assert_eq!(&got, b"hello upstream");
		drop(upstream_peer);

		handle.await.unwrap().unwrap();
		let (sent, _received) = counters.totals();
		assert_eq!(sent, 14);
	}

	#[tokio::test]
	async fn one_side_closing_ends_the_tunnel() {
		let (client, client_peer) = tokio::io::duplex(64);
		let (upstream, upstream_peer) = tokio::io::duplex(64);
		let counters = SpliceCounters::new();

		drop(client_peer);
		let res = splice(client, upstream, &counters).await;
		assert!(res.is_ok());
		drop(upstream_peer);
	}
}
