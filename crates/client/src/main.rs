//! supportdesk-chat - terminal chat client
//!
//! Opens a chat channel as an agent towards one customer and relays stdin
//! lines as messages. Useful for poking at the chat backend without the
//! web UI.
//!
//! Commands: `auto` starts automated messages, `stop` stops them,
//! `exit`/`quit` closes the channel. Anything else is sent as a message.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{bail, Context};
use supportdesk_client::shared::{ChannelIdentity, ChatMessage, Role};
use supportdesk_client::{ChatChannel, ChatConfig, ChatSnapshot, ConnectionState};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const AUTO_MESSAGE_INTERVAL: Duration = Duration::from_millis(3000);
const AUTO_MESSAGE_COUNT: u32 = 5;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    supportdesk_client::logging::init("supportdesk_client=info");

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() != 2 {
        bail!("usage: supportdesk-chat <user_id> <customer_id>");
    }
    let identity = ChannelIdentity::from_parts(Some(args[0].as_str()), Some(args[1].as_str()))
        .context("user_id and customer_id must not be blank")?;

    let config = ChatConfig::from_env();
    let url = config.channel_url(&identity)?;
    println!("Connecting to {url}...");
    println!("Commands: 'auto' to start auto-messages, 'stop' to stop, 'exit' to quit");

    let channel = ChatChannel::spawn(config);
    channel.set_identity(Some(identity));
    let printer = tokio::spawn(print_updates(channel.subscribe()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut auto: Option<JoinHandle<()>> = None;

    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "" => {}
            "exit" | "quit" => break,
            "auto" => {
                if auto.as_ref().is_some_and(|task| !task.is_finished()) {
                    println!("Automation already running");
                    continue;
                }
                println!(
                    "Starting automated messages every {}ms",
                    AUTO_MESSAGE_INTERVAL.as_millis()
                );
                auto = Some(tokio::spawn(send_automated(channel.clone())));
            }
            "stop" => match auto.take() {
                Some(task) => {
                    task.abort();
                    println!("Stopped automated messages");
                }
                None => println!("Automation is not running"),
            },
            content => channel.send(content, None),
        }
    }

    if let Some(task) = auto.take() {
        task.abort();
    }
    channel.shutdown();
    drop(channel);
    printer.await.context("printer task failed")?;
    Ok(())
}

async fn send_automated(channel: ChatChannel) {
    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + AUTO_MESSAGE_INTERVAL,
        AUTO_MESSAGE_INTERVAL,
    );
    for n in 1..=AUTO_MESSAGE_COUNT {
        ticker.tick().await;
        channel.send(format!("Automated message #{n}"), None);
    }
    println!("Stopped automated messages");
}

/// Print state changes and every message not printed before.
async fn print_updates(mut updates: watch::Receiver<ChatSnapshot>) {
    let mut printed: HashSet<String> = HashSet::new();
    let mut last_state = ConnectionState::Idle;
    let mut last_error: Option<String> = None;

    while updates.changed().await.is_ok() {
        let snapshot = updates.borrow_and_update().clone();

        if snapshot.state != last_state {
            match &snapshot.state {
                ConnectionState::Open => println!("Connected!"),
                ConnectionState::Idle if last_state != ConnectionState::Idle => {
                    println!("Disconnected")
                }
                ConnectionState::ReconnectExhausted => {
                    println!("Gave up reconnecting. Type 'exit' and start again.")
                }
                state if state.is_connecting() && last_state.is_connected() => {
                    println!("Reconnecting...")
                }
                _ => {}
            }
            last_state = snapshot.state.clone();
        }

        if snapshot.last_error != last_error {
            if let Some(error) = &snapshot.last_error {
                eprintln!("! {error}");
            }
            last_error = snapshot.last_error.clone();
        }

        for message in &snapshot.messages {
            if message.is_placeholder() || printed.contains(&message.id) {
                continue;
            }
            printed.insert(message.id.clone());
            println!("{}", render(message));
        }
    }
}

fn render(message: &ChatMessage) -> String {
    let who = match message.role {
        Role::Actor => "you",
        Role::Counterparty => "customer",
        Role::System => "system",
        Role::Assistant => "bot",
    };
    format!(
        "[{}] {}: {}",
        message.timestamp.format("%H:%M:%S"),
        who,
        message.content
    )
}
