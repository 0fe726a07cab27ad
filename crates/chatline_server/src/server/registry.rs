#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chatline_domain::{Presence, Username};
use parking_lot::Mutex;
use thiserror::Error;

use crate::server::peer::{ConnId, Peer};
use crate::util::time::{Clock, SystemClock};

/// Registry rejections. `Display` is the text sent back to the client.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
	#[error("User already registered.")]
	AlreadyRegistered,

	#[error("Username is already taken.")]
	UsernameTaken,

	#[error("IP address is already in use.")]
	IpInUse,

	#[error("User not found or already unregistered.")]
	NotFound,
}

/// Registration policy knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryPolicy {
	/// Reject a registration when the origin address already owns a session.
	pub unique_ip: bool,
}

#[derive(Debug)]
struct Session {
	username: Username,
	peer: Peer,
}

#[derive(Debug)]
struct UserRecord {
	origin: String,
	conn_id: ConnId,
}

/// All tables live behind one lock; every entry for a user is inserted and
/// removed in the same critical section.
#[derive(Debug, Default)]
struct Tables {
	sessions: HashMap<ConnId, Session>,
	users: BTreeMap<Username, UserRecord>,
	statuses: HashMap<Username, Presence>,
	last_active: HashMap<Username, Instant>,
}

impl Tables {
	fn remove_user(&mut self, conn_id: ConnId) -> Option<Username> {
		let session = self.sessions.remove(&conn_id)?;
		self.users.remove(&session.username);
		self.statuses.remove(&session.username);
		self.last_active.remove(&session.username);
		Some(session.username)
	}
}

/// Shared session/user/presence state.
///
/// No method awaits while the lock is held; callers copy `Peer` handles out
/// before doing any I/O.
#[derive(Debug)]
pub struct SessionRegistry {
	tables: Mutex<Tables>,
	clock: Arc<dyn Clock>,
	policy: RegistryPolicy,
}

impl SessionRegistry {
	pub fn new(policy: RegistryPolicy) -> Self {
		Self::with_clock(policy, Arc::new(SystemClock))
	}

	pub fn with_clock(policy: RegistryPolicy, clock: Arc<dyn Clock>) -> Self {
		Self {
			tables: Mutex::new(Tables::default()),
			clock,
			policy,
		}
	}

	pub fn policy(&self) -> RegistryPolicy {
		self.policy
	}

	/// Bind `peer` to `username`. Checks and insert happen atomically.
	pub fn register(&self, peer: &Peer, username: &Username, origin: &str) -> Result<(), RegistryError> {
		let now = self.clock.now();
		let mut t = self.tables.lock();

		if t.sessions.contains_key(&peer.conn_id()) {
			return Err(RegistryError::AlreadyRegistered);
		}
		if t.users.contains_key(username) {
			return Err(RegistryError::UsernameTaken);
		}
		if self.policy.unique_ip && t.users.values().any(|u| u.origin == origin) {
			return Err(RegistryError::IpInUse);
		}

		t.sessions.insert(
			peer.conn_id(),
			Session {
				username: username.clone(),
				peer: peer.clone(),
			},
		);
		t.users.insert(
			username.clone(),
			UserRecord {
				origin: origin.to_string(),
				conn_id: peer.conn_id(),
			},
		);
		t.statuses.insert(username.clone(), Presence::Online);
		t.last_active.insert(username.clone(), now);
		Ok(())
	}

	/// Remove every entry belonging to the session on `conn_id`.
	pub fn unregister(&self, conn_id: ConnId) -> Result<Username, RegistryError> {
		self.tables.lock().remove_user(conn_id).ok_or(RegistryError::NotFound)
	}

	pub fn lookup_username(&self, conn_id: ConnId) -> Option<Username> {
		self.tables.lock().sessions.get(&conn_id).map(|s| s.username.clone())
	}

	pub fn lookup_connection(&self, username: &str) -> Option<Peer> {
		let t = self.tables.lock();
		let record = t.users.get(username)?;
		t.sessions.get(&record.conn_id).map(|s| s.peer.clone())
	}

	/// Handles of every registered connection except `conn_id`.
	pub fn peers_except(&self, conn_id: ConnId) -> Vec<Peer> {
		self.tables
			.lock()
			.sessions
			.iter()
			.filter(|(id, _)| **id != conn_id)
			.map(|(_, s)| s.peer.clone())
			.collect()
	}

	/// Explicit status change; also counts as activity.
	pub fn set_status(&self, username: &str, status: Presence) -> Result<(), RegistryError> {
		let now = self.clock.now();
		let mut t = self.tables.lock();
		let Some(current) = t.statuses.get_mut(username) else {
			return Err(RegistryError::NotFound);
		};
		*current = status;
		if let Some(last) = t.last_active.get_mut(username) {
			*last = now;
		}
		Ok(())
	}

	pub fn status(&self, username: &str) -> Option<Presence> {
		self.tables.lock().statuses.get(username).copied()
	}

	/// Record activity for `username`. Returns false if the user is unknown.
	pub fn touch(&self, username: &str) -> bool {
		let now = self.clock.now();
		match self.tables.lock().last_active.get_mut(username) {
			Some(last) => {
				*last = now;
				true
			}
			None => false,
		}
	}

	/// All users with their status, ordered by username.
	pub fn snapshot_all(&self) -> Vec<(Username, Presence)> {
		let t = self.tables.lock();
		t.users
			.keys()
			.map(|name| (name.clone(), t.statuses.get(name).copied().unwrap_or_default()))
			.collect()
	}

	pub fn snapshot_one(&self, username: &str) -> Option<(Username, Presence)> {
		let t = self.tables.lock();
		let (name, _) = t.users.get_key_value(username)?;
		Some((name.clone(), t.statuses.get(username).copied().unwrap_or_default()))
	}

	/// Flip users idle for longer than `idle_timeout` to OFFLINE.
	///
	/// Returns the users demoted by this call. Users already OFFLINE are left
	/// alone and nobody is ever removed.
	pub fn demote_idle(&self, idle_timeout: Duration) -> Vec<Username> {
		let now = self.clock.now();
		let mut t = self.tables.lock();
		let Tables {
			statuses, last_active, ..
		} = &mut *t;

		let mut demoted = Vec::new();
		for (name, last) in last_active.iter() {
			if now.saturating_duration_since(*last) <= idle_timeout {
				continue;
			}
			if let Some(status) = statuses.get_mut(name)
				&& *status != Presence::Offline
			{
				*status = Presence::Offline;
				demoted.push(name.clone());
			}
		}
		demoted.sort();
		demoted
	}

	pub fn len(&self) -> usize {
		self.tables.lock().sessions.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Panics if the tables disagree about who is registered.
	#[cfg(test)]
	pub(crate) fn origin(&self, username: &str) -> Option<String> {
		self.tables.lock().users.get(username).map(|u| u.origin.clone())
	}

	#[cfg(test)]
	pub(crate) fn assert_consistent(&self) {
		let t = self.tables.lock();
		assert_eq!(t.sessions.len(), t.users.len(), "sessions vs users");
		assert_eq!(t.users.len(), t.statuses.len(), "users vs statuses");
		assert_eq!(t.users.len(), t.last_active.len(), "users vs last_active");
		for (name, record) in &t.users {
			assert!(t.statuses.contains_key(name), "{name} missing status");
			assert!(t.last_active.contains_key(name), "{name} missing last_active");
			let session = t.sessions.get(&record.conn_id).expect("session for user");
			assert_eq!(&session.username, name);
		}
	}

	/// True if `username` appears in any table.
	#[cfg(test)]
	pub(crate) fn knows(&self, username: &str) -> bool {
		let t = self.tables.lock();
		t.users.contains_key(username)
			|| t.statuses.contains_key(username)
			|| t.last_active.contains_key(username)
			|| t.sessions.values().any(|s| s.username.as_str() == username)
	}
}
