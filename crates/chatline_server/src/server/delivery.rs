#![forbid(unsafe_code)]

use std::time::Duration;

use chatline_domain::Username;
use chatline_protocol::FramingError;
use chatline_protocol::pb::{self, MessageType};
use thiserror::Error;
use tracing::debug;

use crate::server::peer::ConnId;
use crate::server::registry::SessionRegistry;

/// Failure to hand one frame to one peer.
#[derive(Debug, Error)]
pub enum DeliveryError {
	#[error(transparent)]
	Framing(#[from] FramingError),

	#[error("write timed out after {0:?}")]
	Timeout(Duration),

	/// An earlier write was cut off mid-frame; the stream is no longer usable.
	#[error("peer stream is broken")]
	Broken,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
	pub delivered: usize,
	pub failed: usize,
}

#[derive(Debug)]
pub enum DirectOutcome {
	Delivered,
	RecipientNotFound,
	RecipientUnreachable(DeliveryError),
}

/// Push `content` from `sender` to every registered connection except the
/// sender's own. Recipients that fail are skipped.
pub async fn broadcast(
	registry: &SessionRegistry,
	sender_conn: ConnId,
	sender: &Username,
	content: &str,
) -> BroadcastOutcome {
	let push = pb::Response::incoming(sender.as_str(), content, MessageType::Broadcast);
	let peers = registry.peers_except(sender_conn);

	let results = futures::future::join_all(peers.iter().map(|peer| peer.send(&push))).await;

	let mut outcome = BroadcastOutcome::default();
	for (peer, result) in peers.iter().zip(results) {
		match result {
			Ok(_) => outcome.delivered += 1,
			Err(e) => {
				outcome.failed += 1;
				metrics::counter!("chatline_server_delivery_failures_total").increment(1);
				debug!(conn_id = peer.conn_id(), error = %e, "broadcast recipient skipped");
			}
		}
	}

	metrics::counter!("chatline_server_messages_broadcast_total").increment(1);
	outcome
}

/// Push `content` from `sender` to the connection registered as `recipient`.
pub async fn direct(registry: &SessionRegistry, sender: &Username, recipient: &str, content: &str) -> DirectOutcome {
	let Some(peer) = registry.lookup_connection(recipient) else {
		return DirectOutcome::RecipientNotFound;
	};

	let push = pb::Response::incoming(sender.as_str(), content, MessageType::Direct);
	match peer.send(&push).await {
		Ok(_) => {
			metrics::counter!("chatline_server_messages_direct_total").increment(1);
			DirectOutcome::Delivered
		}
		Err(e) => {
			metrics::counter!("chatline_server_delivery_failures_total").increment(1);
			DirectOutcome::RecipientUnreachable(e)
		}
	}
}
