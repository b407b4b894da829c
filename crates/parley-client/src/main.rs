use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use parley_client::{
    BackoffStrategy, ChatClient, ClientConfig, ClientEvent, ConnectionState,
};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(name = "parley-client")]
struct Args {
    /// Gateway chat endpoint
    #[arg(long, env = "PARLEY_URL", default_value = "ws://127.0.0.1:5050/chat")]
    url: String,
    /// Display name attached to sent messages
    #[arg(long, env = "PARLEY_NAME", default_value = "anonymous")]
    name: String,
    #[arg(long, default_value = "general")]
    channel: String,
    /// Offer a new E2EE session and print its id
    #[arg(long, default_value_t = false)]
    initiate: bool,
    /// Answer the E2EE session with this id
    #[arg(long, value_name = "SESSION_ID", conflicts_with = "initiate")]
    session: Option<String>,
    #[arg(long, default_value_t = 5)]
    max_reconnect_attempts: u32,
    /// Fixed delay between reconnect attempts instead of exponential backoff
    #[arg(long, value_name = "MILLIS")]
    reconnect_delay_ms: Option<u64>,
}

fn print_event(event: &ClientEvent) {
    match event {
        ClientEvent::StateChanged(status) => match &status.error {
            Some(err) => println!("* {} ({})", status.state, err),
            None => println!("* {}", status.state),
        },
        ClientEvent::Message(message) => {
            let badge = match (message.envelope.encrypted, message.e2ee_verified) {
                (true, true) => "[e2ee] ",
                (true, false) => "[e2ee?] ",
                _ => "",
            };
            println!(
                "#{} {}<{}> {}",
                message.envelope.channel_id, badge, message.envelope.sender_name, message.text
            );
        }
        ClientEvent::MessageError { envelope, error } => {
            println!("! message from {}: {}", envelope.sender_name, error)
        }
        ClientEvent::E2eeEstablished {
            session_id,
            fingerprint,
        } => println!("* E2EE session {} established, fingerprint {}", session_id, fingerprint),
        ClientEvent::Candidate {
            session_id,
            payload,
        } => println!("* candidate for {}: {}", session_id, payload),
        ClientEvent::HandshakeFailed { session_id, error } => {
            println!("! handshake {} failed: {}", session_id, error)
        }
        ClientEvent::EventsDropped { count } => println!("! {} incoming events dropped", count),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    parley_common::init_tracing_with_default("parley_client=warn");
    let args = Args::parse();

    let backoff = match args.reconnect_delay_ms {
        Some(ms) => BackoffStrategy::Fixed(Duration::from_millis(ms)),
        None => BackoffStrategy::default(),
    };
    let config = ClientConfig {
        max_reconnect_attempts: args.max_reconnect_attempts,
        backoff,
        ..ClientConfig::default()
    };

    let (client, mut events) = ChatClient::new(config);
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(&event);
        }
    });

    client.connect(&args.url).await?;
    client.join_channel(&args.channel).await?;

    if args.initiate {
        let session_id = client.start_handshake().await?;
        println!("* share this session id with your peer: {}", session_id);
    } else if let Some(session_id) = &args.session {
        client.join_handshake(session_id).await?;
    }

    let mut channel = args.channel.clone();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let result = match line.split_once(' ').unwrap_or((line, "")) {
            ("/quit", _) => break,
            ("/join", target) => {
                let joined = client.join_channel(target.trim()).await;
                if joined.is_ok() {
                    channel = target.trim().to_string();
                }
                joined
            }
            ("/leave", target) => client.leave_channel(target.trim()).await,
            ("/handshake", _) => client.start_handshake().await.map(|session_id| {
                println!("* share this session id with your peer: {}", session_id);
            }),
            ("/accept", session_id) => client.join_handshake(session_id.trim()).await,
            ("/status", _) => {
                let status = client.status();
                println!(
                    "* {} as {:?}, channels {:?}, e2ee {:?}",
                    status.state,
                    client.connection_id(),
                    client.channels(),
                    client.e2ee_session().map(|info| info.fingerprint)
                );
                Ok(())
            }
            _ => client
                .send_message(line, &channel, &args.name)
                .await
                .map(|_| ()),
        };

        if let Err(err) = result {
            println!("! {}", err);
            if client.status().state == ConnectionState::Disconnected {
                break;
            }
        }
    }

    client.disconnect().await;
    Ok(())
}
