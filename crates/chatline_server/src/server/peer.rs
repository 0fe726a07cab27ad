#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chatline_protocol::{FramingError, pb, write_frame};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::warn;

use crate::server::delivery::DeliveryError;

/// Acceptor-assigned connection identity.
pub type ConnId = u64;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Cloneable write handle for one connection.
///
/// The registry hands out clones so any task can push a frame to this
/// connection. A frame is written while holding the writer lock, so frames
/// from concurrent senders never interleave on the wire.
///
/// A write that fails or times out may leave part of a frame on the wire.
/// The peer is then marked broken and its writer shut down, so the client
/// sees a truncated stream instead of a desynchronised one.
#[derive(Clone)]
pub struct Peer {
	conn_id: ConnId,
	writer: Arc<Mutex<BoxedWriter>>,
	broken: Arc<AtomicBool>,
	max_frame_size: usize,
	write_timeout: Duration,
}

impl fmt::Debug for Peer {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Peer").field("conn_id", &self.conn_id).finish_non_exhaustive()
	}
}

impl Peer {
	pub fn new<W>(conn_id: ConnId, writer: W, max_frame_size: usize, write_timeout: Duration) -> Self
	where
		W: AsyncWrite + Send + Unpin + 'static,
	{
		Self {
			conn_id,
			writer: Arc::new(Mutex::new(Box::new(writer))),
			broken: Arc::new(AtomicBool::new(false)),
			max_frame_size,
			write_timeout,
		}
	}

	#[inline]
	pub fn conn_id(&self) -> ConnId {
		self.conn_id
	}

	/// True once a write has failed part-way; every later send is refused.
	pub fn is_broken(&self) -> bool {
		self.broken.load(Ordering::Acquire)
	}

	/// Write one response frame, bounded by the configured write timeout.
	pub async fn send(&self, resp: &pb::Response) -> Result<usize, DeliveryError> {
		if self.is_broken() {
			return Err(DeliveryError::Broken);
		}

		let deadline = tokio::time::Instant::now() + self.write_timeout;
		let Ok(mut writer) = tokio::time::timeout_at(deadline, self.writer.lock()).await else {
			return Err(DeliveryError::Timeout(self.write_timeout));
		};
		// Another sender may have broken the stream while we waited.
		if self.is_broken() {
			return Err(DeliveryError::Broken);
		}

		let err = match tokio::time::timeout_at(deadline, write_frame(&mut *writer, resp, self.max_frame_size)).await {
			Ok(Ok(n)) => {
				metrics::counter!("chatline_server_frames_out_total").increment(1);
				return Ok(n);
			}
			// Rejected before any byte was written.
			Ok(Err(e @ (FramingError::FrameTooLarge { .. } | FramingError::Encode(_)))) => {
				return Err(DeliveryError::Framing(e));
			}
			Ok(Err(e)) => DeliveryError::Framing(e),
			Err(_) => DeliveryError::Timeout(self.write_timeout),
		};

		self.broken.store(true, Ordering::Release);
		let _ = tokio::time::timeout(self.write_timeout, writer.shutdown()).await;
		warn!(conn_id = self.conn_id, error = %err, "write aborted mid-frame; peer marked broken");
		Err(err)
	}

	/// Shut down the write half; later sends fail.
	pub async fn shutdown(&self) {
		let mut writer = self.writer.lock().await;
		let _ = writer.shutdown().await;
	}
}
