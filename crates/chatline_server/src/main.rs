#![forbid(unsafe_code)]

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Context as _;
use chatline_server::config::{default_config_path, load_server_config_from_path};
use chatline_server::{Acceptor, SessionRegistry, spawn_presence_monitor};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: chatline_server <port> <server_name>\n\
\n\
Arguments:\n\
\t<port>          TCP port to listen on (all interfaces)\n\
\t<server_name>   Name shown in logs\n\
\n\
Options:\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	port: u16,
	server_name: String,
}

fn parse_args() -> Args {
	let mut positional = Vec::with_capacity(2);
	for arg in std::env::args().skip(1) {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			other if other.starts_with('-') => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
			_ => positional.push(arg),
		}
	}

	let [port, server_name] = <[String; 2]>::try_from(positional).unwrap_or_else(|_| usage_and_exit());

	let port = port.parse::<u16>().unwrap_or_else(|e| {
		eprintln!("invalid port {port:?}: {e}");
		usage_and_exit();
	});

	if server_name.trim().is_empty() {
		eprintln!("<server_name> must be non-empty");
		usage_and_exit();
	}

	Args { port, server_name }
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,chatline_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	let Some(endpoint) = otlp_endpoint else {
		base.init();
		return;
	};

	use opentelemetry::global;
	use opentelemetry::trace::TracerProvider as _;
	use opentelemetry_otlp::WithExportConfig;

	match opentelemetry_otlp::SpanExporter::builder()
		.with_tonic()
		.with_endpoint(endpoint.clone())
		.build()
	{
		Ok(exporter) => {
			let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
				.with_batch_exporter(exporter)
				.build();
			let tracer = tracer_provider.tracer("chatline_server");
			global::set_tracer_provider(tracer_provider);

			base.with(tracing_opentelemetry::layer().with_tracer(tracer)).init();
			info!(endpoint = %endpoint, "otlp tracing enabled");
		}
		Err(e) => {
			base.init();
			warn!(error = %e, "failed to initialize otlp tracing");
		}
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = parse_args();
	init_tracing();

	let config_path = default_config_path()?;
	let cfg = load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(cfg.server.metrics_bind.as_deref());

	let registry = Arc::new(SessionRegistry::new(cfg.registry_policy()));
	let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.port));
	let acceptor = Acceptor::bind(bind_addr, Arc::clone(&registry), cfg.connection_settings())
		.await
		.with_context(|| format!("bind {bind_addr}"))?;

	let presence = cfg.presence_settings();
	let _presence_task = spawn_presence_monitor(Arc::clone(&registry), presence);

	info!(
		server_name = %args.server_name,
		addr = %acceptor.local_addr()?,
		idle_timeout_secs = presence.idle_timeout.as_secs(),
		unique_ip = cfg.server.unique_ip,
		"chatline_server: listening"
	);

	acceptor.run().await;
	Ok(())
}
