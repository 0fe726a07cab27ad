#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use chatline_domain::{Presence, Username};
use chatline_protocol::pb::{self, Operation, UserListType, UserStatus, request::Payload};
use chatline_protocol::{DEFAULT_MAX_FRAME_SIZE, FramingError, read_frame};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::server::delivery::{self, DeliveryError, DirectOutcome};
use crate::server::peer::{ConnId, Peer};
use crate::server::registry::{RegistryError, SessionRegistry};

pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub max_frame_bytes: usize,
	/// Upper bound on a single frame write to any peer.
	pub write_timeout: Duration,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			write_timeout: DEFAULT_WRITE_TIMEOUT,
		}
	}
}

enum Flow {
	Continue,
	Close,
}

struct Connection {
	conn_id: ConnId,
	origin: Option<SocketAddr>,
	peer: Peer,
	registry: Arc<SessionRegistry>,
	/// `Some` once registration succeeded on this connection.
	username: Option<Username>,
}

/// Serve one client until it unregisters, disconnects or sends a broken frame.
///
/// Application-level rejections are answered and the loop keeps going.
/// Framing errors end the loop without a reply. In every case a registered
/// session is removed from the registry and the write half is shut down once.
pub async fn handle_connection<R, W>(
	conn_id: ConnId,
	mut reader: R,
	writer: W,
	origin: Option<SocketAddr>,
	registry: Arc<SessionRegistry>,
	settings: ConnectionSettings,
) -> anyhow::Result<()>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Send + Unpin + 'static,
{
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("chatline_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("chatline_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let peer = Peer::new(conn_id, writer, settings.max_frame_bytes, settings.write_timeout);
	let mut conn = Connection {
		conn_id,
		origin,
		peer,
		registry,
		username: None,
	};

	let result = loop {
		let req = match read_frame::<pb::Request, _>(&mut reader, settings.max_frame_bytes).await {
			Ok(req) => req,
			Err(e) if e.is_closed() => break Ok(()),
			Err(e) => {
				if !matches!(e, FramingError::Io(_)) {
					metrics::counter!("chatline_server_decode_errors_total").increment(1);
				}
				break Err(anyhow!(e).context("read request frame"));
			}
		};
		metrics::counter!("chatline_server_frames_in_total").increment(1);

		match conn.handle(req).await {
			Ok(Flow::Continue) => {}
			Ok(Flow::Close) => break Ok(()),
			Err(e) => break Err(anyhow!(e).context("write reply")),
		}
	};

	conn.close().await;
	result
}

impl Connection {
	async fn handle(&mut self, req: pb::Request) -> Result<Flow, DeliveryError> {
		let op = match Operation::try_from(req.operation) {
			Ok(
				op @ (Operation::RegisterUser
				| Operation::UnregisterUser
				| Operation::SendMessage
				| Operation::UpdateStatus
				| Operation::GetUsers),
			) => op,
			_ => {
				debug!(conn_id = self.conn_id, operation = req.operation, "unknown request type");
				let mut resp = pb::Response::bad_request(Operation::Unspecified, "Unknown request type.");
				resp.operation = req.operation;
				return self.reply(resp).await;
			}
		};

		let Some(username) = self.username.clone() else {
			return match (op, req.payload) {
				(Operation::RegisterUser, Some(Payload::RegisterUser(r))) => self.register(r.username).await,
				(Operation::RegisterUser, _) => self.malformed(op).await,
				_ => self.reply(pb::Response::bad_request(op, "User not registered.")).await,
			};
		};

		self.registry.touch(username.as_str());

		match (op, req.payload) {
			(Operation::RegisterUser, _) => self.reply(pb::Response::bad_request(op, "User already registered.")).await,
			(Operation::UnregisterUser, Some(Payload::UnregisterUser(r))) => self.unregister(&username, &r.username).await,
			(Operation::SendMessage, Some(Payload::SendMessage(r))) => {
				self.send_message(&username, &r.recipient, &r.content).await
			}
			(Operation::UpdateStatus, Some(Payload::UpdateStatus(r))) => {
				self.update_status(&username, r.new_status).await
			}
			(Operation::GetUsers, Some(Payload::GetUsers(r))) => self.get_users(&r.username).await,
			(op, _) => self.malformed(op).await,
		}
	}

	async fn reply(&self, resp: pb::Response) -> Result<Flow, DeliveryError> {
		self.peer.send(&resp).await?;
		Ok(Flow::Continue)
	}

	async fn malformed(&self, op: Operation) -> Result<Flow, DeliveryError> {
		self.reply(pb::Response::bad_request(op, "Malformed request payload.")).await
	}

	async fn register(&mut self, name: String) -> Result<Flow, DeliveryError> {
		const OP: Operation = Operation::RegisterUser;

		let username = match Username::new(name) {
			Ok(u) => u,
			Err(e) => {
				metrics::counter!("chatline_server_registrations_rejected_total").increment(1);
				return self.reply(pb::Response::bad_request(OP, format!("Invalid username: {e}"))).await;
			}
		};

		let Some(origin) = self.origin else {
			metrics::counter!("chatline_server_registrations_rejected_total").increment(1);
			warn!(conn_id = self.conn_id, "peer address unavailable; refusing registration");
			return self.reply(pb::Response::bad_request(OP, "Unable to retrieve IP address.")).await;
		};

		match self.registry.register(&self.peer, &username, &origin.ip().to_string()) {
			Ok(()) => {
				metrics::counter!("chatline_server_registrations_total").increment(1);
				info!(conn_id = self.conn_id, username = %username, remote = %origin, "user registered");
				self.username = Some(username);
				self.reply(pb::Response::ok(OP, "User registered successfully.")).await
			}
			Err(e) => {
				metrics::counter!("chatline_server_registrations_rejected_total").increment(1);
				debug!(conn_id = self.conn_id, username = %username, reason = %e, "registration rejected");
				self.reply(pb::Response::bad_request(OP, e.to_string())).await
			}
		}
	}

	async fn unregister(&mut self, current: &Username, requested: &str) -> Result<Flow, DeliveryError> {
		const OP: Operation = Operation::UnregisterUser;

		if current.as_str() != requested {
			return self
				.reply(pb::Response::bad_request(OP, "User not registered or username mismatch."))
				.await;
		}

		match self.registry.unregister(self.conn_id) {
			Ok(name) => {
				self.username = None;
				info!(conn_id = self.conn_id, username = %name, "user unregistered");
				if let Err(e) = self.peer.send(&pb::Response::ok(OP, "User unregistered successfully.")).await {
					debug!(conn_id = self.conn_id, error = %e, "unregister reply not delivered");
				}
				Ok(Flow::Close)
			}
			Err(e @ RegistryError::NotFound) => {
				self.username = None;
				self.reply(pb::Response::not_found(OP, e.to_string())).await
			}
			Err(e) => self.reply(pb::Response::bad_request(OP, e.to_string())).await,
		}
	}

	async fn send_message(&self, sender: &Username, recipient: &str, content: &str) -> Result<Flow, DeliveryError> {
		const OP: Operation = Operation::SendMessage;

		if recipient.is_empty() {
			let outcome = delivery::broadcast(&self.registry, self.conn_id, sender, content).await;
			debug!(
				conn_id = self.conn_id,
				delivered = outcome.delivered,
				failed = outcome.failed,
				"broadcast delivered"
			);
			return self
				.reply(pb::Response::ok(OP, "Broadcast message sent successfully."))
				.await;
		}

		let resp = match delivery::direct(&self.registry, sender, recipient, content).await {
			DirectOutcome::Delivered => pb::Response::ok(OP, "Message sent successfully."),
			DirectOutcome::RecipientNotFound => pb::Response::not_found(OP, "Recipient not found."),
			DirectOutcome::RecipientUnreachable(e) => {
				warn!(conn_id = self.conn_id, recipient, error = %e, "direct message not delivered");
				pb::Response::not_found(OP, "Recipient is no longer reachable.")
			}
		};
		self.reply(resp).await
	}

	async fn update_status(&self, username: &Username, raw: i32) -> Result<Flow, DeliveryError> {
		const OP: Operation = Operation::UpdateStatus;

		let Ok(status) = UserStatus::try_from(raw) else {
			return self.reply(pb::Response::bad_request(OP, "Invalid status value.")).await;
		};

		let presence = Presence::from(status);
		let resp = match self.registry.set_status(username.as_str(), presence) {
			Ok(()) => {
				debug!(conn_id = self.conn_id, username = %username, status = %presence, "status updated");
				pb::Response::ok(OP, "Status updated successfully.")
			}
			Err(e) => pb::Response::not_found(OP, e.to_string()),
		};
		self.reply(resp).await
	}

	async fn get_users(&self, filter: &str) -> Result<Flow, DeliveryError> {
		const OP: Operation = Operation::GetUsers;

		let resp = if filter.is_empty() {
			let users = self.registry.snapshot_all();
			pb::Response::ok(OP, "All users fetched successfully.").with_result(user_list(UserListType::All, users))
		} else {
			match self.registry.snapshot_one(filter) {
				Some(user) => pb::Response::ok(OP, "User fetched successfully.")
					.with_result(user_list(UserListType::Single, vec![user])),
				None => pb::Response::not_found(OP, "User not found.")
					.with_result(user_list(UserListType::Single, Vec::new())),
			}
		};
		self.reply(resp).await
	}

	async fn close(&mut self) {
		self.username = None;
		if let Some(name) = self.registry.lookup_username(self.conn_id)
			&& self.registry.unregister(self.conn_id).is_ok()
		{
			info!(conn_id = self.conn_id, username = %name, "session removed on disconnect");
		}
		self.peer.shutdown().await;
	}
}

fn user_list(kind: UserListType, users: Vec<(Username, Presence)>) -> pb::response::Payload {
	pb::response::Payload::UserList(pb::UserListResponse {
		r#type: kind as i32,
		users: users
			.into_iter()
			.map(|(name, presence)| pb::User {
				username: name.into_string(),
				status: UserStatus::from(presence) as i32,
			})
			.collect(),
	})
}
