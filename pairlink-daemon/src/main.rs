mod approval;
mod cli;
mod config;

use anyhow::{Context, Result};
use clap::Parser;
use pairlink_protocol::trust::{FileKeyValueStore, TrustStore};
use pairlink_protocol::{
    CertificateInfo, Engine, EngineEvent, LocalIdentity, PairingEvent, PluginDispatcher,
};
use std::sync::Arc;
use tracing::{error, info, warn};

use approval::PolicyDelegate;
use cli::{Cli, Command};
use config::Config;

/// Main daemon state
struct Daemon {
    config: Config,
    identity: LocalIdentity,
    trust: Arc<TrustStore>,
}

impl Daemon {
    /// Create a new daemon: directories, certificate and trust store
    fn new(config: Config) -> Result<Self> {
        config
            .ensure_directories()
            .context("Failed to create directories")?;

        let info = config.device_info()?;
        let certificate = CertificateInfo::load_or_generate(&config.paths.cert_dir, &info.device_id)
            .context("Failed to load certificate")?;
        let identity = LocalIdentity::new(info, certificate)
            .context("Certificate does not match the configured device id")?;

        let store = FileKeyValueStore::new(config.trust_dir())
            .context("Failed to open trust store")?;
        let trust = Arc::new(TrustStore::new(Arc::new(store)));

        Ok(Self {
            config,
            identity,
            trust,
        })
    }

    /// Run the engine until Ctrl-C
    async fn run(self) -> Result<()> {
        let local = &self.identity.info;
        info!("Pairlink daemon running");
        info!("Device: {} ({})", local.device_name, local.device_id);
        info!("Type: {}", local.device_type.as_str());
        info!("Protocol version: {}", local.protocol_version);
        info!("Fingerprint: {}", self.identity.fingerprint());

        let engine = Engine::new(
            self.config.engine_config(),
            self.identity.clone(),
            self.trust.clone(),
            PluginDispatcher::new(),
            Arc::new(PolicyDelegate::new(self.config.pairing.policy)),
        );
        let mut events = engine.subscribe();
        engine.start().await.context("Failed to start engine")?;

        info!("Press Ctrl+C to stop");
        loop {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    if let Err(e) = signal {
                        error!("Failed to listen for Ctrl-C: {}", e);
                    }
                    info!("Received shutdown signal");
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => log_event(&event),
                    None => break,
                },
            }
        }

        engine.stop().await;
        info!("Daemon shutdown complete");
        Ok(())
    }

    /// Print every trust record
    fn list_devices(&self) -> Result<()> {
        let records = self.trust.records().context("Failed to read trust records")?;
        if records.is_empty() {
            println!("No known devices");
            return Ok(());
        }
        for record in records {
            println!(
                "{}  {:?}  {}  last seen {}",
                record.device_id, record.state, record.fingerprint, record.last_seen
            );
        }
        Ok(())
    }

    fn unpair(&self, device_id: &str) -> Result<()> {
        if self
            .trust
            .remove(device_id)
            .with_context(|| format!("Failed to remove trust record for {}", device_id))?
        {
            println!("Forgot {}", device_id);
        } else {
            println!("{} was not known", device_id);
        }
        Ok(())
    }
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::Started {
            tcp_port,
            discovery_port,
        } => info!(
            "Listening on TCP port {}, discovery port {:?}",
            tcp_port, discovery_port
        ),
        EngineEvent::Stopped => info!("Engine stopped"),
        EngineEvent::DeviceDiscovered { info, address } => info!(
            "Discovered {} ({}) at {}",
            info.device_name, info.device_id, address
        ),
        EngineEvent::SessionOpened {
            device_id,
            device_name,
            fingerprint,
        } => info!("Connected to {} ({}), {}", device_name, device_id, fingerprint),
        EngineEvent::SessionClosed { device_id } => info!("Disconnected from {}", device_id),
        EngineEvent::Pairing(PairingEvent::RequestReceived {
            device_id,
            device_name,
            their_fingerprint,
        }) => info!(
            "{} ({}) wants to pair, fingerprint {}",
            device_name, device_id, their_fingerprint
        ),
        EngineEvent::Pairing(event) => info!("Pairing: {:?}", event),
        EngineEvent::TrustViolation { device_id, .. } => {
            warn!("Refused {}: certificate changed", device_id)
        }
        EngineEvent::ConnectionFailed {
            device_id,
            address,
            error,
        } => warn!(
            "Connection with {} at {} failed: {}",
            device_id.as_deref().unwrap_or("unknown device"),
            address,
            error
        ),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(config::default_config_path);
    let config = Config::load(&config_path).context("Failed to load configuration")?;

    cli::init_logging(&config.logging.level, cli.verbose)?;
    info!("Configuration loaded from {:?}", config_path);

    let daemon = Daemon::new(config).context("Failed to create daemon")?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => daemon.run().await,
        Command::Devices => daemon.list_devices(),
        Command::Unpair { device_id } => daemon.unpair(&device_id),
        Command::Fingerprint => {
            println!("{}", daemon.identity.fingerprint());
            Ok(())
        }
    }
}
