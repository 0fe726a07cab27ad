#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chatline_client_core::{ChatClient, ClientCoreError, ensure_ok};
use chatline_domain::Presence;
use chatline_protocol::pb::{MessageType, Operation, StatusCode, UserListType, UserStatus};
use chatline_server::{Acceptor, ConnectionSettings, RegistryPolicy, SessionRegistry};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

static LOG_INIT: OnceLock<()> = OnceLock::new();

fn init_test_logging() {
	LOG_INIT.get_or_init(|| {
		if std::env::var_os("CHATLINE_TEST_LOG").is_none() {
			return;
		}

		let _ = tracing_subscriber::fmt()
			.with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "debug".to_string()))
			.with_target(false)
			.try_init();
	});
}

struct TestServer {
	addr: SocketAddr,
	registry: Arc<SessionRegistry>,
	task: JoinHandle<()>,
}

impl TestServer {
	async fn start() -> Self {
		init_test_logging();

		let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
		let addr = listener.local_addr().expect("local addr");
		let registry = Arc::new(SessionRegistry::new(RegistryPolicy::default()));
		let acceptor = Acceptor::from_listener(listener, registry.clone(), ConnectionSettings::default());
		let task = tokio::spawn(acceptor.run());

		Self { addr, registry, task }
	}

	async fn client(&self) -> ChatClient {
		ChatClient::connect(self.addr).await.expect("connect")
	}

	async fn registered(&self, name: &str) -> ChatClient {
		let mut client = self.client().await;
		ensure_ok(client.register(name).await.expect("register")).expect("register ok");
		client
	}

	/// Poll until `cond` holds; registry updates after a disconnect are asynchronous.
	async fn wait_for(&self, mut cond: impl FnMut(&SessionRegistry) -> bool) {
		let waited = tokio::time::timeout(Duration::from_secs(2), async {
			while !cond(&self.registry) {
				tokio::time::sleep(Duration::from_millis(10)).await;
			}
		})
		.await;
		assert!(waited.is_ok(), "condition not reached in time");
	}
}

impl Drop for TestServer {
	fn drop(&mut self) {
		self.task.abort();
	}
}

#[tokio::test]
async fn example_scenario_over_tcp() {
	let server = TestServer::start().await;

	let mut alice = server.client().await;
	let resp = alice.register("alice").await.expect("register");
	assert_eq!(resp.status_code(), StatusCode::Ok);
	assert_eq!(resp.message, "User registered successfully.");

	let mut impostor = server.client().await;
	let resp = impostor.register("alice").await.expect("register");
	assert_eq!(resp.status_code(), StatusCode::BadRequest);
	assert_eq!(resp.message, "Username is already taken.");

	let resp = alice.update_status(Presence::Busy).await.expect("status");
	assert_eq!(resp.message, "Status updated successfully.");
	assert_eq!(server.registry.status("alice"), Some(Presence::Busy));

	let mut observer = server.registered("observer").await;
	let resp = observer.get_users(Some("alice")).await.expect("get users");
	let list = resp.user_list().expect("list");
	assert_eq!(list.users.len(), 1);
	assert_eq!(list.users[0].status(), UserStatus::Busy);

	let resp = alice.unregister("alice").await.expect("unregister");
	assert_eq!(resp.operation(), Operation::UnregisterUser);
	assert_eq!(resp.message, "User unregistered successfully.");

	let resp = observer.get_users(Some("alice")).await.expect("get users");
	assert_eq!(resp.status_code(), StatusCode::NotFound);
	assert_eq!(resp.user_list().expect("list").r#type(), UserListType::Single);
	assert!(resp.user_list().expect("list").users.is_empty());

	// The name is free again once the session is gone.
	let resp = impostor.register("alice").await.expect("register");
	assert!(resp.is_ok(), "{resp:?}");
}

#[tokio::test]
async fn broadcast_excludes_sender() {
	let server = TestServer::start().await;
	let mut alice = server.registered("alice").await;
	let mut bob = server.registered("bob").await;
	let mut carol = server.registered("carol").await;

	let resp = alice.broadcast("hello everyone").await.expect("broadcast");
	assert_eq!(resp.message, "Broadcast message sent successfully.");

	for client in [&mut bob, &mut carol] {
		let msg = client.next_incoming().await.expect("incoming");
		assert_eq!(msg.sender, "alice");
		assert_eq!(msg.content, "hello everyone");
		assert_eq!(msg.r#type(), MessageType::Broadcast);
	}

	let echoed = alice
		.next_incoming_within(Duration::from_millis(150))
		.await
		.expect("read");
	assert!(echoed.is_none(), "sender received its own broadcast: {echoed:?}");
}

#[tokio::test]
async fn pushes_interleave_with_replies() {
	let server = TestServer::start().await;
	let mut alice = server.registered("alice").await;
	let mut bob = server.registered("bob").await;

	ensure_ok(alice.direct("bob", "first").await.expect("direct")).expect("ok");
	ensure_ok(alice.direct("bob", "second").await.expect("direct")).expect("ok");

	// Bob's reply to this request arrives after both pushes; they must be kept.
	let resp = bob.get_users(None).await.expect("get users");
	let names: Vec<&str> = resp
		.user_list()
		.expect("list")
		.users
		.iter()
		.map(|u| u.username.as_str())
		.collect();
	assert_eq!(names, vec!["alice", "bob"]);
	assert_eq!(bob.pending_incoming(), 2);

	let first = bob.next_incoming().await.expect("first");
	let second = bob.next_incoming().await.expect("second");
	assert_eq!((first.content.as_str(), second.content.as_str()), ("first", "second"));
	assert_eq!(first.r#type(), MessageType::Direct);
}

#[tokio::test]
async fn direct_to_unknown_user_is_not_found() {
	let server = TestServer::start().await;
	let mut alice = server.registered("alice").await;
	let mut bob = server.registered("bob").await;

	let err = ensure_ok(alice.direct("nobody", "hello?").await.expect("direct")).unwrap_err();
	match err {
		ClientCoreError::Rejected { status, message, .. } => {
			assert_eq!(status, StatusCode::NotFound);
			assert_eq!(message, "Recipient not found.");
		}
		other => panic!("unexpected error: {other:?}"),
	}

	let stray = bob.next_incoming_within(Duration::from_millis(150)).await.expect("read");
	assert!(stray.is_none());
}

#[tokio::test]
async fn disconnect_cleans_up_registry() {
	let server = TestServer::start().await;
	let alice = server.registered("alice").await;
	let mut bob = server.registered("bob").await;
	assert_eq!(server.registry.len(), 2);

	drop(alice);
	server.wait_for(|r| r.status("alice").is_none()).await;
	assert_eq!(server.registry.len(), 1);

	let resp = bob.direct("alice", "still there?").await.expect("direct");
	assert_eq!(resp.status_code(), StatusCode::NotFound);

	bob.close().await.expect("close");
	server.wait_for(|r| r.is_empty()).await;
}

#[tokio::test]
async fn requests_before_registration_are_refused() {
	let server = TestServer::start().await;
	let mut anon = server.client().await;

	let resp = anon.broadcast("hi").await.expect("broadcast");
	assert_eq!(resp.status_code(), StatusCode::BadRequest);
	assert_eq!(resp.message, "User not registered.");
	assert!(server.registry.is_empty());
}
