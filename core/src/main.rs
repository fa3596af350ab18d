/// RoomLink terminal chat - connects to one room and chats from stdin
use colored::*;
use roomlink_core::{
    ChatConfig, ChatSession, ConnectionStatus, HistoryClient, LocalIdentity, SessionEvent,
};
use std::env;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let Some(room_id) = args.get(1).cloned() else {
        eprintln!("Usage: {} <room_id> [token]", args.first().map(String::as_str).unwrap_or("chat"));
        eprintln!("  token falls back to the ROOMLINK_TOKEN environment variable");
        std::process::exit(2);
    };
    let token = args
        .get(2)
        .cloned()
        .or_else(|| env::var("ROOMLINK_TOKEN").ok())
        .unwrap_or_default();
    if token.trim().is_empty() {
        anyhow::bail!("No bearer token; pass it as the second argument or set ROOMLINK_TOKEN");
    }

    let config = ChatConfig::from_env();
    info!("Backend: {}", config.base_url);

    // Resolve who we are so incoming echoes are recognized as ours
    let identity = match HistoryClient::new(&config, token.clone())?.fetch_profile().await {
        Ok(me) => LocalIdentity::from_session_value(&me),
        Err(e) => {
            warn!("Could not fetch profile ({}), echo detection degraded", e);
            LocalIdentity::default()
        }
    };

    let session = ChatSession::new(config, token, identity)?;
    let mut events = session.events();
    session.connect(&room_id).await?;

    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(event),
                Err(RecvError::Lagged(n)) => {
                    warn!("Dropped {} events, terminal too slow", n);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    println!(
        "{} {} {}",
        "Joined room".bright_cyan(),
        room_id.bright_white().bold(),
        "(type /quit to leave)".dimmed()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim() == "/quit" {
            break;
        }
        session.send(&line).await;
    }

    session.disconnect().await;
    printer.abort();
    println!("{}", "Left room".bright_cyan());
    Ok(())
}

fn print_event(event: SessionEvent) {
    match event {
        SessionEvent::StatusChanged { status } => {
            let label = match status {
                ConnectionStatus::Connected => "connected".green(),
                ConnectionStatus::Connecting => "connecting...".yellow(),
                ConnectionStatus::Disconnected => "disconnected".red(),
                ConnectionStatus::Error => "connection error".red().bold(),
            };
            println!("{} {}", "●".dimmed(), label);
        }
        SessionEvent::NewMessage { message } => {
            let time = message
                .created_at
                .with_timezone(&chrono::Local)
                .format("%H:%M");
            let name = if message.is_mine {
                "you".bright_green().bold()
            } else {
                message.sender_label().bright_blue().bold()
            };
            let marker = if message.is_mine && message.delivery == roomlink_core::DeliveryStatus::Pending {
                " …".dimmed()
            } else {
                "".normal()
            };
            println!("[{}] {}: {}{}", time.to_string().dimmed(), name, message.content, marker);
        }
        SessionEvent::MessageDelivered { message } => {
            println!("{} {}", "✓".green(), format!("delivered: {}", message.content).dimmed());
        }
        SessionEvent::HistoryLoaded { count } => {
            println!("{}", format!("— {} earlier messages —", count).dimmed());
        }
    }
}
