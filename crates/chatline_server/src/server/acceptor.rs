#![forbid(unsafe_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::server::connection::{ConnectionSettings, handle_connection};
use crate::server::peer::ConnId;
use crate::server::registry::SessionRegistry;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Listening socket plus the set of live connection tasks.
pub struct Acceptor {
	listener: TcpListener,
	registry: Arc<SessionRegistry>,
	settings: ConnectionSettings,
	tasks: JoinSet<()>,
	next_conn_id: ConnId,
}

impl Acceptor {
	pub async fn bind(
		addr: SocketAddr,
		registry: Arc<SessionRegistry>,
		settings: ConnectionSettings,
	) -> io::Result<Self> {
		let listener = TcpListener::bind(addr).await?;
		Ok(Self::from_listener(listener, registry, settings))
	}

	pub fn from_listener(listener: TcpListener, registry: Arc<SessionRegistry>, settings: ConnectionSettings) -> Self {
		Self {
			listener,
			registry,
			settings,
			tasks: JoinSet::new(),
			next_conn_id: 1,
		}
	}

	pub fn local_addr(&self) -> io::Result<SocketAddr> {
		self.listener.local_addr()
	}

	/// Connection tasks spawned and not yet reaped.
	pub fn active_connections(&self) -> usize {
		self.tasks.len()
	}

	/// Accept forever. Accept errors are logged and retried after a short pause.
	pub async fn run(mut self) {
		loop {
			tokio::select! {
				accepted = self.listener.accept() => match accepted {
					Ok((stream, remote)) => {
						let conn_id = self.next_conn_id;
						self.next_conn_id += 1;
						metrics::counter!("chatline_server_connections_total").increment(1);

						if let Err(e) = stream.set_nodelay(true) {
							debug!(conn_id, error = %e, "failed to set TCP_NODELAY");
						}
						let origin = stream.peer_addr().ok();
						let (reader, writer) = stream.into_split();
						info!(conn_id, remote = %remote, "accepted connection");

						let registry = Arc::clone(&self.registry);
						let settings = self.settings.clone();
						self.tasks.spawn(async move {
							match handle_connection(conn_id, reader, writer, origin, registry, settings).await {
								Ok(()) => debug!(conn_id, "connection closed"),
								Err(e) => warn!(conn_id, error = %e, "connection handler exited with error"),
							}
						});
					}
					Err(e) => {
						warn!(error = %e, "accept failed");
						tokio::time::sleep(ACCEPT_BACKOFF).await;
					}
				},
				Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
					if let Err(e) = joined
						&& e.is_panic()
					{
						error!(error = %e, "connection task panicked");
					}
				}
			}
		}
	}
}
