//! # parleyd
//!
//! Headless Parley node. Loads the identity and contact registry, keeps
//! pending key exchanges moving and exchanges envelopes through the offline
//! relay.
//!
//! Send `SIGUSR1` to force an immediate relay fetch.

use std::sync::Arc;

use parley_client::{init_tracing, ClientConfig, ContactRegistry, Inbound, Messenger, OfflineRelay};
use parley_net::{ChannelTransport, RelayHttpClient};
use parley_shared::constants::APP_NAME;
use parley_shared::identity::Identity;
use parley_store::database::default_data_dir;
use parley_store::{Database, SqliteStore};
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Tracing and configuration
    // -----------------------------------------------------------------------
    init_tracing();
    info!("Starting {} node v{}", APP_NAME, env!("CARGO_PKG_VERSION"));

    let config = ClientConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 2. Identity and storage
    // -----------------------------------------------------------------------
    let data_dir = match &config.data_dir {
        Some(dir) => dir.clone(),
        None => default_data_dir()?,
    };
    std::fs::create_dir_all(&data_dir)?;

    let identity = Arc::new(Identity::load_or_generate(&data_dir.join("identity.json"))?);
    info!(address = %identity.address(), "Identity ready");

    let store = Arc::new(SqliteStore::new(Database::open_at(&data_dir.join("parley.db"))?));
    let (transport, outbound) = ChannelTransport::new(config.outbound_capacity);

    let registry = Arc::new(ContactRegistry::new(identity, store, Arc::new(transport)));
    let contacts = registry.load()?;
    info!(contacts, "Contact registry ready");

    let inbound = Arc::new(Inbound::new(registry.clone()));
    let messenger = Messenger::new(registry.clone());

    let mut events = registry.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            debug!(?event, "contact event");
        }
    });

    // -----------------------------------------------------------------------
    // 3. Relay
    // -----------------------------------------------------------------------
    let relay = match &config.relay_url {
        Some(url) => {
            let http = RelayHttpClient::new(url.as_str(), config.http_timeout)?;
            let relay = Arc::new(OfflineRelay::new(
                http,
                registry.clone(),
                inbound,
                config.fetch_cooldown,
            ));
            relay.clone().spawn_push_pump(outbound);
            relay.clone().spawn_fetch_loop(config.fetch_interval);
            info!(relay = %url, "Offline relay enabled");
            Some(relay)
        }
        None => {
            warn!("PARLEY_RELAY_URL not set, outbound envelopes are discarded");
            let mut outbound = outbound;
            tokio::spawn(async move {
                while let Some(out) = outbound.recv().await {
                    debug!(contact = %out.recipient, "no relay, envelope discarded");
                }
            });
            None
        }
    };

    // -----------------------------------------------------------------------
    // 4. Key exchange ticker
    // -----------------------------------------------------------------------
    let ticker = messenger.clone();
    let interval = config.fetch_interval;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(interval);
        loop {
            interval.tick().await;
            let sent = ticker.tick_all();
            if !sent.is_empty() {
                info!(count = sent.len(), "Session keys sent");
            }
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run until shutdown; SIGUSR1 forces a fetch
    // -----------------------------------------------------------------------
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut wake = signal(SignalKind::user_defined1())?;
        loop {
            tokio::select! {
                _ = wake.recv() => {
                    if let Some(relay) = &relay {
                        match relay.fetch(true).await {
                            Ok(outcome) => info!(?outcome, "Forced relay fetch"),
                            Err(e) => warn!(error = %e, "Forced relay fetch failed"),
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down");
                    break;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = relay;
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down");
    }

    registry.commit()?;
    Ok(())
}
