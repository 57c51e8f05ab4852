#![forbid(unsafe_code)]

use murmur_client_core::{ClientConfig, SessionControl, event_kind};
use murmur_protocol::pb;
use murmur_protocol::pb::event_envelope::Event;
use murmur_util::endpoint::DEFAULT_PORT;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: murmur_client [--connect quic://host:port] --room <conversation> [--token <credential>]\n\
\n\
Options:\n\
	--connect   Server endpoint (default: quic://127.0.0.1:{DEFAULT_PORT})\n\
	--room      Conversation to join\n\
	--token     Credential (default: $MURMUR_CLIENT_TOKEN)\n\
	--help      Show this help\n\
\n\
Input:\n\
	<text>               send a message\n\
	/edit <id> <text>    edit one of your messages\n\
	/delete <id>         delete one of your messages\n\
	/quit                leave and disconnect\n"
	);
	std::process::exit(2)
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,murmur_client_core=debug".to_string());
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_target(false)
		.with_writer(std::io::stderr)
		.init();
}

struct Args {
	endpoint: String,
	room: String,
	token: String,
}

fn parse_args() -> Args {
	let mut endpoint = format!("quic://127.0.0.1:{DEFAULT_PORT}");
	let mut room: Option<String> = None;
	let mut token: Option<String> = std::env::var("MURMUR_CLIENT_TOKEN")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--connect" | "--endpoint" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--connect must be non-empty (expected quic://host:port)");
					usage_and_exit();
				}
				endpoint = v;
			}
			"--room" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--room must be non-empty");
					usage_and_exit();
				}
				room = Some(v);
			}
			"--token" => token = Some(it.next().unwrap_or_else(|| usage_and_exit())),
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let Some(room) = room else {
		eprintln!("--room is required");
		usage_and_exit();
	};
	let Some(token) = token else {
		eprintln!("a credential is required (--token or MURMUR_CLIENT_TOKEN)");
		usage_and_exit();
	};

	Args { endpoint, room, token }
}

fn print_message(prefix: &str, m: &pb::MessageEvent) {
	let sender = m.sender.as_ref().map(|s| s.display_name.as_str()).unwrap_or("<unknown>");
	let edited = if m.edited_at_unix_ms.is_some() { " (edited)" } else { "" };
	let attachment = m
		.attachment
		.as_ref()
		.map(|a| format!(" [{}: {}]", a.kind, a.url))
		.unwrap_or_default();
	println!("{prefix}[#{}] {sender}: {}{attachment}{edited}", m.message_id, m.content);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let args = parse_args();

	let cfg = ClientConfig::from_quic_endpoint(&args.endpoint)?;
	info!(server = %args.endpoint, room = %args.room, "connecting");

	let mut control = SessionControl::connect(cfg).await?;
	let me = control.authenticate(&args.token).await?;
	info!(user_id = %me.user_id, display_name = %me.display_name, "signed in");

	control.join(&args.room).await?;
	for m in control.list(&args.room).await? {
		print_message("", &m);
	}

	let mut events = control.open_events_stream().await?;
	let events_task = tokio::spawn(async move {
		let res = events
			.run_events_loop(|ev| match ev.event {
				Some(Event::MessageCreated(m)) => print_message("", &m),
				Some(Event::MessageUpdated(m)) => print_message("~ ", &m),
				Some(Event::MessageDeleted(d)) => println!("- [#{}] deleted", d.message_id),
				None => warn!(kind = event_kind(&ev), "empty event"),
			})
			.await;
		if let Err(e) = res {
			warn!(error = %e, "events stream failed");
		}
	});

	let mut lines = BufReader::new(tokio::io::stdin()).lines();
	while let Some(line) = lines.next_line().await? {
		let line = line.trim();
		if line.is_empty() {
			continue;
		}

		let result = if line == "/quit" {
			break;
		} else if let Some(rest) = line.strip_prefix("/edit ") {
			match rest.trim().split_once(' ').map(|(id, text)| (id.parse::<u64>(), text)) {
				Some((Ok(id), text)) => control.edit(id, text).await.map(|m| print_message("~ ", &m)),
				_ => {
					eprintln!("usage: /edit <id> <text>");
					continue;
				}
			}
		} else if let Some(rest) = line.strip_prefix("/delete ") {
			match rest.trim().parse::<u64>() {
				Ok(id) => control.delete(id).await.map(|id| println!("- [#{id}] deleted")),
				Err(_) => {
					eprintln!("usage: /delete <id>");
					continue;
				}
			}
		} else {
			control.send(&args.room, line, None).await.map(|m| print_message("", &m))
		};

		if let Err(e) = result {
			eprintln!("{e}");
		}
	}

	let _ = control.leave(&args.room).await;
	control.close(0, "bye");
	events_task.abort();
	Ok(())
}
