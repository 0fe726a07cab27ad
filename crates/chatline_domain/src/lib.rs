#![forbid(unsafe_code)]

use core::borrow::Borrow;
use core::fmt;
use core::str::FromStr;

use thiserror::Error;

/// Longest accepted username, in bytes.
pub const MAX_USERNAME_LEN: usize = 64;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("value exceeds {max} bytes")]
	TooLong { max: usize },
	#[error("invalid format: {0}")]
	InvalidFormat(String),
	#[error("unknown presence status: {0}")]
	UnknownPresence(String),
}

/// A registered user's name; the registry's unique key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Username(String);

impl Username {
	/// Validate and wrap a username.
	///
	/// Names must be non-empty, carry no leading/trailing whitespace or control
	/// characters and fit in [`MAX_USERNAME_LEN`] bytes.
	pub fn new(name: impl Into<String>) -> Result<Self, ParseIdError> {
		let name = name.into();
		if name.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		if name.len() > MAX_USERNAME_LEN {
			return Err(ParseIdError::TooLong { max: MAX_USERNAME_LEN });
		}
		if name.trim() != name {
			return Err(ParseIdError::InvalidFormat("surrounding whitespace".into()));
		}
		if name.chars().any(char::is_control) {
			return Err(ParseIdError::InvalidFormat("control characters".into()));
		}
		Ok(Self(name))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for Username {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for Username {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Username::new(s.to_string())
	}
}

impl TryFrom<String> for Username {
	type Error = ParseIdError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		Username::new(value)
	}
}

impl From<Username> for String {
	fn from(value: Username) -> Self {
		value.0
	}
}

impl Borrow<str> for Username {
	fn borrow(&self) -> &str {
		&self.0
	}
}

impl AsRef<str> for Username {
	fn as_ref(&self) -> &str {
		&self.0
	}
}

/// Presence status of a registered user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Presence {
	#[default]
	Online,
	Busy,
	Offline,
}

impl Presence {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			Presence::Online => "online",
			Presence::Busy => "busy",
			Presence::Offline => "offline",
		}
	}
}

impl fmt::Display for Presence {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Presence {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"online" => Ok(Presence::Online),
			"busy" => Ok(Presence::Busy),
			"offline" => Ok(Presence::Offline),
			other => Err(ParseIdError::UnknownPresence(other.to_string())),
		}
	}
}
