//! Wire messages.
//!
//! Declared with prost derives rather than generated from a `.proto` file; tag
//! numbers are part of the wire contract and must not be reused.

use chatline_domain::Presence;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Operation {
	Unspecified = 0,
	RegisterUser = 1,
	UnregisterUser = 2,
	SendMessage = 3,
	UpdateStatus = 4,
	GetUsers = 5,
	/// Server push; never valid in a request.
	IncomingMessage = 6,
}

impl Operation {
	pub fn as_str_name(&self) -> &'static str {
		match self {
			Operation::Unspecified => "OPERATION_UNSPECIFIED",
			Operation::RegisterUser => "REGISTER_USER",
			Operation::UnregisterUser => "UNREGISTER_USER",
			Operation::SendMessage => "SEND_MESSAGE",
			Operation::UpdateStatus => "UPDATE_STATUS",
			Operation::GetUsers => "GET_USERS",
			Operation::IncomingMessage => "INCOMING_MESSAGE",
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum StatusCode {
	Unspecified = 0,
	Ok = 200,
	BadRequest = 400,
	NotFound = 404,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum UserStatus {
	Online = 0,
	Busy = 1,
	Offline = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
	Broadcast = 0,
	Direct = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum UserListType {
	All = 0,
	Single = 1,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterUserRequest {
	#[prost(string, tag = "1")]
	pub username: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UnregisterUserRequest {
	#[prost(string, tag = "1")]
	pub username: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SendMessageRequest {
	/// Empty means broadcast.
	#[prost(string, tag = "1")]
	pub recipient: String,
	#[prost(string, tag = "2")]
	pub content: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateStatusRequest {
	#[prost(enumeration = "UserStatus", tag = "1")]
	pub new_status: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetUsersRequest {
	/// Empty means list everyone.
	#[prost(string, tag = "1")]
	pub username: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Request {
	#[prost(enumeration = "Operation", tag = "1")]
	pub operation: i32,
	#[prost(oneof = "request::Payload", tags = "2, 3, 4, 5, 6")]
	pub payload: Option<request::Payload>,
}

pub mod request {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Payload {
		#[prost(message, tag = "2")]
		RegisterUser(super::RegisterUserRequest),
		#[prost(message, tag = "3")]
		SendMessage(super::SendMessageRequest),
		#[prost(message, tag = "4")]
		UpdateStatus(super::UpdateStatusRequest),
		#[prost(message, tag = "5")]
		GetUsers(super::GetUsersRequest),
		#[prost(message, tag = "6")]
		UnregisterUser(super::UnregisterUserRequest),
	}
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IncomingMessageResponse {
	#[prost(string, tag = "1")]
	pub sender: String,
	#[prost(string, tag = "2")]
	pub content: String,
	#[prost(enumeration = "MessageType", tag = "3")]
	pub r#type: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct User {
	#[prost(string, tag = "1")]
	pub username: String,
	#[prost(enumeration = "UserStatus", tag = "2")]
	pub status: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UserListResponse {
	#[prost(enumeration = "UserListType", tag = "1")]
	pub r#type: i32,
	#[prost(message, repeated, tag = "2")]
	pub users: Vec<User>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Response {
	#[prost(enumeration = "Operation", tag = "1")]
	pub operation: i32,
	#[prost(enumeration = "StatusCode", tag = "2")]
	pub status_code: i32,
	#[prost(string, tag = "3")]
	pub message: String,
	#[prost(oneof = "response::Payload", tags = "4, 5")]
	pub result: Option<response::Payload>,
}

pub mod response {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Payload {
		#[prost(message, tag = "4")]
		IncomingMessage(super::IncomingMessageResponse),
		#[prost(message, tag = "5")]
		UserList(super::UserListResponse),
	}
}

impl Request {
	pub fn register(username: impl Into<String>) -> Self {
		Self {
			operation: Operation::RegisterUser as i32,
			payload: Some(request::Payload::RegisterUser(RegisterUserRequest {
				username: username.into(),
			})),
		}
	}

	pub fn unregister(username: impl Into<String>) -> Self {
		Self {
			operation: Operation::UnregisterUser as i32,
			payload: Some(request::Payload::UnregisterUser(UnregisterUserRequest {
				username: username.into(),
			})),
		}
	}

	/// Send-message request; an empty `recipient` broadcasts.
	pub fn send_message(recipient: impl Into<String>, content: impl Into<String>) -> Self {
		Self {
			operation: Operation::SendMessage as i32,
			payload: Some(request::Payload::SendMessage(SendMessageRequest {
				recipient: recipient.into(),
				content: content.into(),
			})),
		}
	}

	pub fn update_status(status: UserStatus) -> Self {
		Self {
			operation: Operation::UpdateStatus as i32,
			payload: Some(request::Payload::UpdateStatus(UpdateStatusRequest {
				new_status: status as i32,
			})),
		}
	}

	/// Get-users request; an empty `username` lists everyone.
	pub fn get_users(username: impl Into<String>) -> Self {
		Self {
			operation: Operation::GetUsers as i32,
			payload: Some(request::Payload::GetUsers(GetUsersRequest {
				username: username.into(),
			})),
		}
	}
}

impl Response {
	pub fn new(operation: Operation, status: StatusCode, message: impl Into<String>) -> Self {
		Self {
			operation: operation as i32,
			status_code: status as i32,
			message: message.into(),
			result: None,
		}
	}

	pub fn ok(operation: Operation, message: impl Into<String>) -> Self {
		Self::new(operation, StatusCode::Ok, message)
	}

	pub fn bad_request(operation: Operation, message: impl Into<String>) -> Self {
		Self::new(operation, StatusCode::BadRequest, message)
	}

	pub fn not_found(operation: Operation, message: impl Into<String>) -> Self {
		Self::new(operation, StatusCode::NotFound, message)
	}

	/// Server push carrying a chat message.
	pub fn incoming(sender: impl Into<String>, content: impl Into<String>, kind: MessageType) -> Self {
		let message = match kind {
			MessageType::Broadcast => "Broadcast message incoming.",
			MessageType::Direct => "Message incoming.",
		};
		Self::ok(Operation::IncomingMessage, message).with_result(response::Payload::IncomingMessage(
			IncomingMessageResponse {
				sender: sender.into(),
				content: content.into(),
				r#type: kind as i32,
			},
		))
	}

	pub fn with_result(mut self, result: response::Payload) -> Self {
		self.result = Some(result);
		self
	}

	pub fn is_ok(&self) -> bool {
		self.status_code() == StatusCode::Ok
	}

	pub fn incoming_message(&self) -> Option<&IncomingMessageResponse> {
		match &self.result {
			Some(response::Payload::IncomingMessage(m)) => Some(m),
			_ => None,
		}
	}

	pub fn user_list(&self) -> Option<&UserListResponse> {
		match &self.result {
			Some(response::Payload::UserList(l)) => Some(l),
			_ => None,
		}
	}
}

impl From<Presence> for UserStatus {
	fn from(value: Presence) -> Self {
		match value {
			Presence::Online => UserStatus::Online,
			Presence::Busy => UserStatus::Busy,
			Presence::Offline => UserStatus::Offline,
		}
	}
}

impl From<UserStatus> for Presence {
	fn from(value: UserStatus) -> Self {
		match value {
			UserStatus::Online => Presence::Online,
			UserStatus::Busy => Presence::Busy,
			UserStatus::Offline => Presence::Offline,
		}
	}
}
