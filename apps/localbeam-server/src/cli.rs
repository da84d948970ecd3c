use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use localbeam_proto::{SignalKind, SignalMessage};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, warn};

use localbeam_server::Config;

#[derive(Parser, Debug)]
#[command(name = "localbeam-server")]
#[command(about = "LocalBeam signaling relay and peer-list watcher")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Port to listen on
    #[arg(long, env = "LOCALBEAM_PORT")]
    pub port: Option<u16>,

    /// Interface to bind
    #[arg(long, env = "LOCALBEAM_BIND")]
    pub bind: Option<String>,

    /// Name to advertise on the local network
    #[arg(long, env = "LOCALBEAM_SERVICE_NAME")]
    pub service_name: Option<String>,

    /// Skip the local-network advertisement
    #[arg(long, env = "LOCALBEAM_NO_ADVERTISE")]
    pub no_advertise: bool,
}

impl ServeArgs {
    pub fn apply(self, mut config: Config) -> Config {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(bind) = self.bind {
            config.bind_host = bind;
        }
        if let Some(name) = self.service_name {
            config.service_name = name;
        }
        if self.no_advertise {
            config.advertise = false;
        }
        config
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Register with a relay and print every peer-list snapshot
    Watch {
        /// Relay URL (e.g., ws://localhost:5000)
        #[arg(short, long, default_value = "ws://localhost:5000")]
        url: String,

        /// Client id to register as
        #[arg(short, long)]
        client_id: Option<String>,

        /// Exit after this many snapshots
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },
}

pub async fn run_watch_client(
    url: String,
    client_id: Option<String>,
    count: Option<usize>,
) -> Result<()> {
    let client_id =
        client_id.unwrap_or_else(|| format!("watch-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]));
    debug!("Connecting to {} as {}", url, client_id);

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("Failed to connect to {}: {}", url, e);
            return Err(anyhow!("Connection failed: {}", e));
        }
        Err(_) => {
            error!("Connection timeout after 5 seconds");
            return Err(anyhow!("Connection timeout - is the relay running?"));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let register = SignalMessage::register(client_id.clone()).to_json()?;
    write.send(Message::Text(register.into())).await?;

    let mut seen = 0usize;
    while let Some(frame) = read.next().await {
        let text = match frame? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let message = match SignalMessage::parse(&text) {
            Ok(message) => message,
            Err(err) => {
                warn!("Ignoring unreadable frame: {}", err);
                continue;
            }
        };
        match message.kind {
            SignalKind::PeerList => {
                let peers = message.peers.unwrap_or_default();
                println!("peers ({}): {}", peers.len(), peers.join(", "));
                seen += 1;
                if count.is_some_and(|limit| seen >= limit) {
                    break;
                }
            }
            other => {
                println!(
                    "{} from {}",
                    other,
                    message.client_id.as_deref().unwrap_or("?")
                );
            }
        }
    }

    let _ = write.send(Message::Close(None)).await;
    Ok(())
}
