//! Connects to the platform and prints events as they arrive.
//!
//! Usage: QUILL_TOKEN=... cargo run --example connect

use quill_sdk::{Client, ClientConfig, Event};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let token = std::env::var("QUILL_TOKEN")?;
    let bot = std::env::var("QUILL_BOT").is_ok();

    let mut client = Client::new(ClientConfig::new(token).bot(bot))?;
    client.login().await?;
    println!("logged in, waiting for ready...");

    while let Some(event) = client.recv().await {
        match event {
            Event::Ready => {
                println!(
                    "ready: {} guild(s) cached, logged in as {}",
                    client.cache().guild_count(),
                    client
                        .cache()
                        .current_user()
                        .map(|user| user.username)
                        .unwrap_or_default(),
                );
            }
            Event::MessageCreate { message } => {
                println!(
                    "[{}] {}: {}",
                    message.channel_id,
                    message
                        .author
                        .map(|author| author.username)
                        .unwrap_or_default(),
                    message.content.unwrap_or_default(),
                );
            }
            Event::Warn(text) => eprintln!("warn: {text}"),
            Event::Error(text) => {
                eprintln!("fatal: {text}");
                break;
            }
            // Raw packets shadow the typed events above; skip the noise.
            Event::Raw { .. } => {}
            other => println!("event: {}", other.kind()),
        }
    }
    Ok(())
}
