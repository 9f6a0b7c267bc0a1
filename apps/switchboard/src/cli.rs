use anyhow::Result;
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use switchboard_proto::{ClientEnvelope, ServerEnvelope, Verdict};

#[derive(Parser, Debug)]
#[command(name = "switchboard")]
#[command(about = "One-to-one call signaling relay and probe client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect to a running relay and exercise the signaling surface
    Probe {
        /// Relay URL (e.g., ws://localhost:8000)
        #[arg(short, long, default_value = "ws://localhost:8000")]
        url: String,

        /// Display name to register under
        #[arg(short, long, default_value = "probe")]
        name: String,

        /// Only list registered endpoints, without registering
        #[arg(long)]
        list_only: bool,
    },
}

/// Minimal signaling client used to check a deployed relay from the
/// command line: register (optionally), list the registered endpoints,
/// print them, and exit.
pub async fn run_probe(url: String, name: String, list_only: bool) -> Result<()> {
    let ws_url = format!("{}/call", url.trim_end_matches('/'));
    debug!("connecting to {ws_url}");

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&ws_url)).await {
        Ok(Ok(connected)) => connected,
        Ok(Err(err)) => anyhow::bail!("connection to {ws_url} failed: {err}"),
        Err(_) => anyhow::bail!("connection to {ws_url} timed out"),
    };
    let (mut write, mut read) = ws_stream.split();

    if !list_only {
        send(&mut write, &ClientEnvelope::Register { name: name.clone() }).await?;
        match receive(&mut read).await? {
            ServerEnvelope::RegisterResponse {
                response: Verdict::Accepted,
                ..
            } => println!("registered as {name}"),
            ServerEnvelope::RegisterResponse {
                response: Verdict::Rejected,
                message,
            } => anyhow::bail!(
                "registration rejected: {}",
                message.unwrap_or_else(|| "no reason given".into())
            ),
            other => anyhow::bail!("unexpected response to register: {other:?}"),
        }
    }

    send(&mut write, &ClientEnvelope::List).await?;
    match receive(&mut read).await? {
        ServerEnvelope::ListResponse { list } => {
            println!("{} endpoint(s) registered", list.len());
            for endpoint in list {
                println!("  {endpoint}");
            }
        }
        other => anyhow::bail!("unexpected response to list: {other:?}"),
    }

    Ok(())
}

async fn send<S>(write: &mut S, envelope: &ClientEnvelope) -> Result<()>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let json = serde_json::to_string(envelope)?;
    write.send(Message::Text(json.into())).await?;
    Ok(())
}

/// Read frames until one parses as a known server envelope, with a
/// per-frame timeout so a silent relay fails the probe quickly.
async fn receive<S>(read: &mut S) -> Result<ServerEnvelope>
where
    S: StreamExt<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    loop {
        let frame = match timeout(Duration::from_secs(5), read.next()).await {
            Ok(Some(frame)) => frame?,
            Ok(None) => anyhow::bail!("relay closed the connection"),
            Err(_) => anyhow::bail!("timed out waiting for the relay"),
        };
        if let Message::Text(text) = frame {
            match serde_json::from_str::<ServerEnvelope>(text.as_str()) {
                Ok(ServerEnvelope::Unknown) => continue,
                Ok(envelope) => return Ok(envelope),
                Err(err) => debug!("skipping unparseable frame: {err}"),
            }
        }
    }
}
