use anyhow::{bail, Context, Result};
use std::net::SocketAddr;
use std::time::Duration;

use crate::cli::ServeArgs;
use crate::websocket::TransportConfig;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    /// `None` disables expiry of unanswered calls.
    pub ring_timeout: Option<Duration>,
    pub sweep_interval: Duration,
    pub shutdown_grace: Duration,
    pub transport: TransportConfig,
}

impl TryFrom<ServeArgs> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;
        if args.sweep_interval_secs == 0 {
            bail!("sweep interval must be greater than zero");
        }
        if args.ping_interval_secs == 0 {
            bail!("ping interval must be greater than zero");
        }
        if args.idle_timeout_secs <= args.ping_interval_secs {
            bail!(
                "idle timeout ({}s) must exceed the ping interval ({}s)",
                args.idle_timeout_secs,
                args.ping_interval_secs
            );
        }
        if args.outbox_capacity == 0 {
            bail!("outbox capacity must be greater than zero");
        }
        let ring_timeout = match args.ring_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Ok(Self {
            listen_addr,
            ring_timeout,
            sweep_interval: Duration::from_secs(args.sweep_interval_secs),
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
            transport: TransportConfig {
                outbox_capacity: args.outbox_capacity,
                ping_interval: Duration::from_secs(args.ping_interval_secs),
                idle_timeout: Duration::from_secs(args.idle_timeout_secs),
            },
        })
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            ring_timeout: Some(Duration::from_secs(60)),
            sweep_interval: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(2),
            transport: TransportConfig::default(),
        }
    }
}
