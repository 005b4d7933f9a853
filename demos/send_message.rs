//! Logs in, waits for readiness, and sends one message.
//!
//! Usage: QUILL_TOKEN=... cargo run --example send_message -- <channel_id> <text>

use quill_sdk::{Client, ClientConfig, Event, Snowflake};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let channel_id: Snowflake = args
        .next()
        .ok_or("missing channel id argument")?
        .parse()
        .map_err(|_| "channel id must be numeric")?;
    let text = args.collect::<Vec<_>>().join(" ");
    if text.is_empty() {
        return Err("missing message text".into());
    }

    let token = std::env::var("QUILL_TOKEN")?;
    let mut client = Client::new(ClientConfig::new(token).bot(true))?;
    client.login().await?;

    while let Some(event) = client.recv().await {
        match event {
            Event::Ready => break,
            Event::Error(text) => return Err(text.into()),
            _ => {}
        }
    }

    let message = client.send_message(channel_id, &text).await?;
    println!("sent message {} to channel {}", message.id, channel_id);

    client.logout()?;
    Ok(())
}
