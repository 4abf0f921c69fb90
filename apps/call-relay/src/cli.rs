use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

#[derive(Parser, Debug)]
#[command(name = "call-relay", author, version)]
#[command(about = "Signaling relay for two-party WebRTC calls")]
pub struct Cli {
    /// Defaults to `serve` when omitted.
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay
    Serve(ServeArgs),
    /// Register as a user and print every message the relay sends
    Listen {
        /// Relay WebSocket URL
        #[arg(short, long, default_value = "ws://localhost:3000/ws")]
        url: String,

        /// User id to register under
        #[arg(long)]
        user: String,
    },
}

#[derive(Parser, Debug, Clone)]
pub struct ServeArgs {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "CALL_RELAY_LISTEN_ADDR", default_value = "0.0.0.0:3000")]
    pub listen_addr: String,

    /// Seconds a call may ring unanswered before it is dropped (0 disables).
    #[arg(long, env = "CALL_RELAY_RING_TIMEOUT_SECS", default_value_t = 60)]
    pub ring_timeout_secs: u64,

    /// How often to look for stale ringing calls.
    #[arg(long, env = "CALL_RELAY_SWEEP_INTERVAL_SECS", default_value_t = 5)]
    pub sweep_interval_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "CALL_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,

    /// How often each client is pinged.
    #[arg(long, env = "CALL_RELAY_PING_INTERVAL_SECS", default_value_t = 25)]
    pub ping_interval_secs: u64,

    /// Drop a client that has sent nothing, pongs included, for this long.
    #[arg(long, env = "CALL_RELAY_IDLE_TIMEOUT_SECS", default_value_t = 60)]
    pub idle_timeout_secs: u64,

    /// Messages buffered per connection before deliveries to it fail.
    #[arg(long, env = "CALL_RELAY_OUTBOX_CAPACITY", default_value_t = 256)]
    pub outbox_capacity: usize,
}

impl Default for ServeArgs {
    fn default() -> Self {
        ServeArgs::parse_from(["call-relay"])
    }
}

pub async fn run_listen_client(url: String, user: String) -> Result<()> {
    debug!("Connecting to {} as {}", url, user);

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("Failed to connect to {}: {}", url, e);
            return Err(anyhow!("Connection failed: {}", e));
        }
        Err(_) => {
            return Err(anyhow!("Connection timeout - is the relay running?"));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let register = json!({ "type": "register", "userId": user }).to_string();
    write.send(Message::Text(register.into())).await?;
    eprintln!("registered as {user}; waiting for messages (Ctrl-C to quit)");

    loop {
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => println!("{}", text.as_str()),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(anyhow!("WebSocket error: {}", e)),
            },
            _ = tokio::signal::ctrl_c() => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
        }
    }

    Ok(())
}
