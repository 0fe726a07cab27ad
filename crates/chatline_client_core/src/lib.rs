#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::time::Duration;

use chatline_domain::Presence;
use chatline_protocol::pb::{self, Operation, UserStatus};
use bytes::BytesMut;
use chatline_protocol::{DEFAULT_MAX_FRAME_SIZE, FramingError, try_decode_frame_from_buffer, write_frame};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::{debug, info};

/// Client connection settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
	pub max_frame_bytes: usize,
	pub connect_timeout: Duration,
	/// How long a request waits for its reply.
	pub reply_timeout: Duration,
}

impl Default for ClientConfig {
	fn default() -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			connect_timeout: Duration::from_secs(10),
			reply_timeout: Duration::from_secs(10),
		}
	}
}

/// Errors for client core operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientCoreError {
	/// Connection establishment failed.
	#[error("failed to connect: {0}")]
	Connect(String),

	/// Protocol framing error.
	#[error(transparent)]
	Framing(#[from] FramingError),

	/// Protocol error (unexpected message ordering/types).
	#[error("protocol error: {0}")]
	Protocol(String),

	/// The server answered with a non-OK status.
	#[error("{operation} rejected ({status:?}): {message}")]
	Rejected {
		operation: &'static str,
		status: pb::StatusCode,
		message: String,
	},

	#[error("timed out waiting for {0}")]
	Timeout(&'static str),
}

/// One TCP session with a chat server.
///
/// Request helpers return the server's reply for that operation. Pushed
/// messages that arrive while waiting are queued and handed out by
/// [`ChatClient::next_incoming`] in arrival order.
///
/// Reads go through an internal buffer, so a timed-out wait never drops part
/// of a frame.
pub struct ChatClient {
	stream: TcpStream,
	cfg: ClientConfig,
	read_buf: BytesMut,
	incoming: VecDeque<pb::IncomingMessageResponse>,
}

impl ChatClient {
	pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientCoreError> {
		Self::connect_with(addr, ClientConfig::default()).await
	}

	pub async fn connect_with(addr: impl ToSocketAddrs, cfg: ClientConfig) -> Result<Self, ClientCoreError> {
		let stream = match tokio::time::timeout(cfg.connect_timeout, TcpStream::connect(addr)).await {
			Ok(Ok(stream)) => stream,
			Ok(Err(e)) => return Err(ClientCoreError::Connect(e.to_string())),
			Err(_) => return Err(ClientCoreError::Timeout("connect")),
		};
		let _ = stream.set_nodelay(true);

		if let Ok(remote) = stream.peer_addr() {
			info!(%remote, "connected");
		}

		Ok(Self {
			stream,
			cfg,
			read_buf: BytesMut::with_capacity(8 * 1024),
			incoming: VecDeque::new(),
		})
	}

	pub async fn register(&mut self, username: &str) -> Result<pb::Response, ClientCoreError> {
		self.request(pb::Request::register(username)).await
	}

	pub async fn broadcast(&mut self, content: &str) -> Result<pb::Response, ClientCoreError> {
		self.request(pb::Request::send_message("", content)).await
	}

	pub async fn direct(&mut self, recipient: &str, content: &str) -> Result<pb::Response, ClientCoreError> {
		self.request(pb::Request::send_message(recipient, content)).await
	}

	pub async fn update_status(&mut self, status: Presence) -> Result<pb::Response, ClientCoreError> {
		self.request(pb::Request::update_status(UserStatus::from(status))).await
	}

	/// `None` lists every user; `Some(name)` asks for one.
	pub async fn get_users(&mut self, username: Option<&str>) -> Result<pb::Response, ClientCoreError> {
		self.request(pb::Request::get_users(username.unwrap_or_default())).await
	}

	pub async fn unregister(&mut self, username: &str) -> Result<pb::Response, ClientCoreError> {
		self.request(pb::Request::unregister(username)).await
	}

	/// Send `req` and wait for the reply to its operation.
	pub async fn request(&mut self, req: pb::Request) -> Result<pb::Response, ClientCoreError> {
		let op = req.operation();
		write_frame(&mut self.stream, &req, self.cfg.max_frame_bytes).await?;

		let reply_timeout = self.cfg.reply_timeout;
		match tokio::time::timeout(reply_timeout, self.read_reply(op)).await {
			Ok(res) => res,
			Err(_) => Err(ClientCoreError::Timeout(op.as_str_name())),
		}
	}

	async fn read_reply(&mut self, op: Operation) -> Result<pb::Response, ClientCoreError> {
		loop {
			let resp = self.read_response().await?;
			if resp.operation() == Operation::IncomingMessage {
				self.queue_incoming(resp)?;
				continue;
			}
			if resp.operation != op as i32 {
				return Err(ClientCoreError::Protocol(format!(
					"expected reply to {}, got {resp:?}",
					op.as_str_name()
				)));
			}
			return Ok(resp);
		}
	}

	async fn read_response(&mut self) -> Result<pb::Response, ClientCoreError> {
		loop {
			let max = self.cfg.max_frame_bytes;
			if let Some(resp) = try_decode_frame_from_buffer::<pb::Response>(&mut self.read_buf, max)? {
				return Ok(resp);
			}

			// `read_buf` is cancel safe: bytes land in the buffer or not at all.
			let n = self.stream.read_buf(&mut self.read_buf).await.map_err(FramingError::from)?;
			if n == 0 {
				if self.read_buf.is_empty() {
					return Err(FramingError::Closed.into());
				}
				return Err(ClientCoreError::Protocol(format!(
					"stream closed inside a frame ({} bytes buffered)",
					self.read_buf.len()
				)));
			}
		}
	}

	fn queue_incoming(&mut self, resp: pb::Response) -> Result<(), ClientCoreError> {
		match resp.result {
			Some(pb::response::Payload::IncomingMessage(m)) => {
				debug!(sender = %m.sender, queued = self.incoming.len() + 1, "queued incoming message");
				self.incoming.push_back(m);
				Ok(())
			}
			other => Err(ClientCoreError::Protocol(format!(
				"INCOMING_MESSAGE without message payload: {other:?}"
			))),
		}
	}

	/// Next pushed message, waiting on the socket if none is queued.
	pub async fn next_incoming(&mut self) -> Result<pb::IncomingMessageResponse, ClientCoreError> {
		loop {
			if let Some(m) = self.incoming.pop_front() {
				return Ok(m);
			}

			let resp = self.read_response().await?;
			if resp.operation() != Operation::IncomingMessage {
				return Err(ClientCoreError::Protocol(format!("unsolicited reply: {resp:?}")));
			}
			self.queue_incoming(resp)?;
		}
	}

	/// Like [`ChatClient::next_incoming`] but gives up after `wait`.
	pub async fn next_incoming_within(
		&mut self,
		wait: Duration,
	) -> Result<Option<pb::IncomingMessageResponse>, ClientCoreError> {
		match tokio::time::timeout(wait, self.next_incoming()).await {
			Ok(res) => res.map(Some),
			Err(_) => Ok(None),
		}
	}

	/// Messages already received but not yet taken.
	pub fn pending_incoming(&self) -> usize {
		self.incoming.len()
	}

	/// Close the write side; the server sees a disconnect.
	pub async fn close(mut self) -> Result<(), ClientCoreError> {
		self.stream.shutdown().await.map_err(FramingError::from)?;
		Ok(())
	}
}

/// Turn a non-OK reply into [`ClientCoreError::Rejected`].
pub fn ensure_ok(resp: pb::Response) -> Result<pb::Response, ClientCoreError> {
	if resp.is_ok() {
		return Ok(resp);
	}
	Err(ClientCoreError::Rejected {
		operation: resp.operation().as_str_name(),
		status: resp.status_code(),
		message: resp.message,
	})
}

#[cfg(test)]
mod tests {
	use chatline_protocol::{encode_frame_default, read_frame};
	use tokio::io::AsyncWriteExt;

	use super::*;

	#[test]
	fn ensure_ok_maps_rejections() {
		let ok = pb::Response::ok(Operation::RegisterUser, "User registered successfully.");
		assert!(ensure_ok(ok).is_ok());

		let err = ensure_ok(pb::Response::not_found(Operation::SendMessage, "Recipient not found.")).unwrap_err();
		match err {
			ClientCoreError::Rejected {
				operation,
				status,
				message,
			} => {
				assert_eq!(operation, "SEND_MESSAGE");
				assert_eq!(status, pb::StatusCode::NotFound);
				assert_eq!(message, "Recipient not found.");
			}
			other => panic!("unexpected error: {other:?}"),
		}
	}

	#[tokio::test]
	async fn pushes_received_while_waiting_are_queued() {
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
		let addr = listener.local_addr().expect("addr");

		let server = tokio::spawn(async move {
			let (mut sock, _) = listener.accept().await.expect("accept");
			let req: pb::Request = read_frame(&mut sock, DEFAULT_MAX_FRAME_SIZE).await.expect("request");
			assert_eq!(req.operation(), Operation::GetUsers);

			for text in ["one", "two"] {
				let push = pb::Response::incoming("bob", text, pb::MessageType::Broadcast);
				write_frame(&mut sock, &push, DEFAULT_MAX_FRAME_SIZE).await.expect("push");
			}
			let reply = pb::Response::ok(Operation::GetUsers, "All users fetched successfully.");
			write_frame(&mut sock, &reply, DEFAULT_MAX_FRAME_SIZE).await.expect("reply");
			sock
		});

		let mut client = ChatClient::connect(addr).await.expect("connect");
		let resp = client.get_users(None).await.expect("get users");
		assert_eq!(resp.operation(), Operation::GetUsers);
		assert_eq!(client.pending_incoming(), 2);

		assert_eq!(client.next_incoming().await.expect("first").content, "one");
		assert_eq!(client.next_incoming().await.expect("second").content, "two");
		assert!(
			client
				.next_incoming_within(Duration::from_millis(50))
				.await
				.expect("no error")
				.is_none()
		);

		drop(server.await.expect("server task"));
	}

	#[tokio::test]
	async fn timeout_mid_frame_keeps_the_partial_frame() {
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
		let addr = listener.local_addr().expect("addr");
		let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

		let server = tokio::spawn(async move {
			let (mut sock, _) = listener.accept().await.expect("accept");
			let push = pb::Response::incoming("bob", "split across a stall", pb::MessageType::Direct);
			let frame = encode_frame_default(&push).expect("encode");

			sock.write_all(&frame[..6]).await.expect("head");
			sock.flush().await.expect("flush");
			release_rx.await.expect("release");
			sock.write_all(&frame[6..]).await.expect("tail");
			sock
		});

		let mut client = ChatClient::connect(addr).await.expect("connect");
		let waited = client
			.next_incoming_within(Duration::from_millis(100))
			.await
			.expect("no error");
		assert!(waited.is_none());

		release_tx.send(()).expect("server waiting");
		let msg = client.next_incoming().await.expect("whole frame");
		assert_eq!(msg.sender, "bob");
		assert_eq!(msg.content, "split across a stall");

		drop(server.await.expect("server task"));
	}
}
