#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::info;

use crate::server::registry::SessionRegistry;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_PRESENCE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct PresenceSettings {
	/// Inactivity after which a user is shown as OFFLINE.
	pub idle_timeout: Duration,
	/// How often the registry is scanned.
	pub interval: Duration,
}

impl Default for PresenceSettings {
	fn default() -> Self {
		Self {
			idle_timeout: DEFAULT_IDLE_TIMEOUT,
			interval: DEFAULT_PRESENCE_INTERVAL,
		}
	}
}

/// Spawn the idle monitor. It runs until the runtime shuts down.
pub fn spawn_presence_monitor(registry: Arc<SessionRegistry>, settings: PresenceSettings) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut ticker = tokio::time::interval(settings.interval);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

		loop {
			ticker.tick().await;
			sweep(&registry, settings.idle_timeout);
		}
	})
}

/// One monitor pass. Returns how many users were demoted.
pub fn sweep(registry: &SessionRegistry, idle_timeout: Duration) -> usize {
	let demoted = registry.demote_idle(idle_timeout);
	for name in &demoted {
		info!(
			username = %name,
			idle_timeout_secs = idle_timeout.as_secs(),
			"user set to OFFLINE due to inactivity"
		);
	}
	metrics::counter!("chatline_server_presence_demotions_total").increment(demoted.len() as u64);
	demoted.len()
}
