use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use drift_client_core::config::Config;
use drift_client_core::peer::webrtc::WebRtcConnector;
use drift_client_core::session::media::NullMediaSource;
use drift_client_core::session::{ControllerEvent, Intent, Notice};
use drift_client_core::start_session;
use drift_client_core::storage::FileSessionStore;
use drift_proto::ChatMode;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// Terminal client for the drift random-pairing chat service.
#[derive(Parser, Debug)]
#[command(name = "drift")]
struct Cli {
    /// Rendezvous server URL (ws:// or wss://).
    #[arg(long, short = 's', env = "DRIFT_SERVER_URL")]
    server: Option<String>,

    /// Chat mode: text, voice or video. Voice/video negotiate the data
    /// channel only; this binary has no capture devices.
    #[arg(long, short = 'm', default_value = "text")]
    mode: ChatMode,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(server) = cli.server {
        config.server_url = server;
    }

    let store = Arc::new(FileSessionStore::open_default()?);
    let mut session = start_session(
        cli.mode,
        config,
        Arc::new(WebRtcConnector),
        Arc::new(NullMediaSource),
        store,
    );

    println!("searching for a partner… (/next, /leave, /quit)");
    session.intents.send(Intent::StartSearch)?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = session.events.recv() => match event {
                Some(event) => print_event(event),
                None => break,
            },
            line = lines.next_line() => match line? {
                Some(line) => {
                    let intent = match line.trim() {
                        "" => continue,
                        "/quit" => break,
                        "/next" => Intent::Next,
                        "/leave" => Intent::Leave,
                        "/find" => Intent::StartSearch,
                        "/cancel" => Intent::Cancel,
                        text => Intent::SendMessage(text.to_string()),
                    };
                    session.intents.send(intent)?;
                }
                None => break,
            },
        }
    }

    session.shutdown().await;
    Ok(())
}

fn print_event(event: ControllerEvent) {
    match event {
        ControllerEvent::StateChanged(state) => println!("· state: {:?}", state),
        ControllerEvent::PeerMessage(text) => println!("partner: {}", text),
        ControllerEvent::Notice(notice) => match notice {
            Notice::Searching => println!("· searching…"),
            Notice::Connected { .. } => println!("· connected, say hi"),
            Notice::PartnerLeft { message } => println!("· {}", message),
            Notice::SearchCancelled { message } => println!("· {}", message),
            Notice::NoMatch { message } | Notice::NoUsersOnline { message } => {
                println!("· {}", message)
            }
            Notice::MediaFailed { error } => println!("· media error: {}", error),
            Notice::Banned { message } => println!("· banned: {}", message),
            Notice::PartnerBanned { message } => println!("· {}", message),
            Notice::TransportOffline { reason } => println!("· server connection lost: {}", reason),
            Notice::TransportOnline => println!("· server connection up"),
        },
        ControllerEvent::Error(error) => eprintln!("error: {}", error),
    }
}
