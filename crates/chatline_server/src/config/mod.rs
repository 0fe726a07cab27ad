#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use chatline_protocol::DEFAULT_MAX_FRAME_SIZE;
use serde::Deserialize;
use tracing::{info, warn};

use crate::server::connection::{ConnectionSettings, DEFAULT_WRITE_TIMEOUT};
use crate::server::presence::{DEFAULT_IDLE_TIMEOUT, DEFAULT_PRESENCE_INTERVAL, PresenceSettings};
use crate::server::registry::RegistryPolicy;

/// Env var naming an explicit config file.
pub const CHATLINE_CONFIG_ENV: &str = "CHATLINE_CONFIG";

/// Config path: `$CHATLINE_CONFIG`, else `~/.chatline/server.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	if let Ok(v) = std::env::var(CHATLINE_CONFIG_ENV) {
		let v = v.trim();
		if !v.is_empty() {
			return Ok(PathBuf::from(v));
		}
	}

	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".chatline").join("server.toml"))
}

/// Load the server config from TOML (if present) and process env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);
	apply_overrides(&mut cfg, |key| std::env::var(key).ok());

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Inactivity before a user is shown as OFFLINE.
	pub idle_timeout: Duration,
	/// Presence monitor tick.
	pub presence_interval: Duration,
	/// Reject a registration when the client's IP already owns a session.
	pub unique_ip: bool,
	pub max_frame_bytes: usize,
	/// Upper bound on a single frame write to any peer.
	pub write_timeout: Duration,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			idle_timeout: DEFAULT_IDLE_TIMEOUT,
			presence_interval: DEFAULT_PRESENCE_INTERVAL,
			unique_ip: false,
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			write_timeout: DEFAULT_WRITE_TIMEOUT,
			metrics_bind: None,
		}
	}
}

impl ServerConfig {
	pub fn connection_settings(&self) -> ConnectionSettings {
		ConnectionSettings {
			max_frame_bytes: self.server.max_frame_bytes,
			write_timeout: self.server.write_timeout,
		}
	}

	pub fn presence_settings(&self) -> PresenceSettings {
		PresenceSettings {
			idle_timeout: self.server.idle_timeout,
			interval: self.server.presence_interval,
		}
	}

	pub fn registry_policy(&self) -> RegistryPolicy {
		RegistryPolicy {
			unique_ip: self.server.unique_ip,
		}
	}

	fn from_file(file: FileConfig) -> Self {
		let defaults = ServerSettings::default();
		let s = file.server;

		Self {
			server: ServerSettings {
				idle_timeout: nonzero_or(
					"idle_timeout_secs",
					s.idle_timeout_secs.map(Duration::from_secs),
					defaults.idle_timeout,
				),
				presence_interval: nonzero_or(
					"presence_interval_ms",
					s.presence_interval_ms.map(Duration::from_millis),
					defaults.presence_interval,
				),
				unique_ip: s.unique_ip.unwrap_or(defaults.unique_ip),
				max_frame_bytes: match s.max_frame_bytes {
					Some(0) => {
						warn!("server config: max_frame_bytes must be > 0; using default");
						defaults.max_frame_bytes
					}
					Some(v) => v,
					None => defaults.max_frame_bytes,
				},
				write_timeout: nonzero_or(
					"write_timeout_ms",
					s.write_timeout_ms.map(Duration::from_millis),
					defaults.write_timeout,
				),
				metrics_bind: s.metrics_bind.filter(|v| !v.trim().is_empty()),
			},
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	idle_timeout_secs: Option<u64>,
	presence_interval_ms: Option<u64>,
	unique_ip: Option<bool>,
	max_frame_bytes: Option<usize>,
	write_timeout_ms: Option<u64>,
	metrics_bind: Option<String>,
}

fn nonzero_or(key: &str, value: Option<Duration>, default: Duration) -> Duration {
	match value {
		Some(v) if v.is_zero() => {
			warn!(key, "server config: zero duration is not allowed; using default");
			default
		}
		Some(v) => v,
		None => default,
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_overrides(cfg: &mut ServerConfig, var: impl Fn(&str) -> Option<String>) {
	if let Some(v) = var("CHATLINE_IDLE_TIMEOUT_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		if secs == 0 {
			warn!("server config: CHATLINE_IDLE_TIMEOUT_SECS=0 ignored");
		} else {
			cfg.server.idle_timeout = Duration::from_secs(secs);
			info!(secs, "server config: idle_timeout overridden by env");
		}
	}

	if let Some(v) = var("CHATLINE_PRESENCE_INTERVAL_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
	{
		if ms == 0 {
			warn!("server config: CHATLINE_PRESENCE_INTERVAL_MS=0 ignored");
		} else {
			cfg.server.presence_interval = Duration::from_millis(ms);
			info!(ms, "server config: presence_interval overridden by env");
		}
	}

	if let Some(v) = var("CHATLINE_UNIQUE_IP")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.server.unique_ip = enabled;
		info!(enabled, "server config: unique_ip overridden by env");
	}

	if let Some(v) = var("CHATLINE_MAX_FRAME_BYTES")
		&& let Ok(bytes) = v.trim().parse::<usize>()
		&& bytes > 0
	{
		cfg.server.max_frame_bytes = bytes;
		info!(bytes, "server config: max_frame_bytes overridden by env");
	}

	if let Some(v) = var("CHATLINE_WRITE_TIMEOUT_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
	{
		if ms == 0 {
			warn!("server config: CHATLINE_WRITE_TIMEOUT_MS=0 ignored");
		} else {
			cfg.server.write_timeout = Duration::from_millis(ms);
			info!(ms, "server config: write_timeout overridden by env");
		}
	}

	if let Some(v) = var("CHATLINE_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;
	use std::io::Write as _;

	use super::*;

	fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
		let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
		move |key| map.get(key).cloned()
	}

	#[test]
	fn missing_file_yields_defaults() {
		let dir = tempfile::tempdir().expect("tempdir");
		let cfg = load_server_config_from_path(&dir.path().join("absent.toml")).expect("load");
		assert_eq!(cfg.server.max_frame_bytes, DEFAULT_MAX_FRAME_SIZE);
		assert_eq!(cfg.server.idle_timeout, DEFAULT_IDLE_TIMEOUT);
	}

	#[test]
	fn file_values_are_applied_and_zeroes_rejected() {
		let mut file = tempfile::NamedTempFile::new().expect("tempfile");
		writeln!(
			file,
			"[server]\nidle_timeout_secs = 30\npresence_interval_ms = 0\nunique_ip = true\nwrite_timeout_ms = 250\nmetrics_bind = \"  \""
		)
		.expect("write");

		let raw = read_toml_if_exists(file.path()).expect("read").expect("present");
		let cfg = ServerConfig::from_file(raw);
		assert_eq!(cfg.server.idle_timeout, Duration::from_secs(30));
		assert_eq!(cfg.server.presence_interval, DEFAULT_PRESENCE_INTERVAL);
		assert!(cfg.server.unique_ip);
		assert_eq!(cfg.server.write_timeout, Duration::from_millis(250));
		assert_eq!(cfg.server.metrics_bind, None);

		assert!(cfg.registry_policy().unique_ip);
		assert_eq!(cfg.presence_settings().idle_timeout, Duration::from_secs(30));
		assert_eq!(cfg.connection_settings().write_timeout, Duration::from_millis(250));
	}

	#[test]
	fn invalid_toml_is_an_error() {
		let mut file = tempfile::NamedTempFile::new().expect("tempfile");
		writeln!(file, "[server\nidle_timeout_secs = ").expect("write");
		assert!(load_server_config_from_path(file.path()).is_err());
	}

	#[test]
	fn env_overrides_win_over_file() {
		let mut cfg = ServerConfig::default();
		apply_overrides(
			&mut cfg,
			env(&[
				("CHATLINE_IDLE_TIMEOUT_SECS", "12"),
				("CHATLINE_PRESENCE_INTERVAL_MS", "0"),
				("CHATLINE_UNIQUE_IP", "yes"),
				("CHATLINE_MAX_FRAME_BYTES", "oops"),
				("CHATLINE_METRICS_BIND", "127.0.0.1:9100"),
			]),
		);

		assert_eq!(cfg.server.idle_timeout, Duration::from_secs(12));
		assert_eq!(cfg.server.presence_interval, DEFAULT_PRESENCE_INTERVAL);
		assert!(cfg.server.unique_ip);
		assert_eq!(cfg.server.max_frame_bytes, DEFAULT_MAX_FRAME_SIZE);
		assert_eq!(cfg.server.metrics_bind.as_deref(), Some("127.0.0.1:9100"));
	}

	#[test]
	fn env_bool_parsing() {
		assert_eq!(parse_env_bool(" ON "), Some(true));
		assert_eq!(parse_env_bool("0"), Some(false));
		assert_eq!(parse_env_bool("maybe"), None);
	}
}
