pub mod config;
pub mod contact;
pub mod error;
pub mod events;
pub mod handshake;
pub mod inbound;
pub mod message;
pub mod registry;
pub mod relay;
pub mod state;

pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use events::ContactEvent;
pub use inbound::{Inbound, InboundSink};
pub use registry::ContactRegistry;
pub use relay::{FetchOutcome, OfflineRelay, PushOutcome};
pub use state::Messenger;

use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("parley_client=debug,parley_net=debug,parley_store=info,warn")
    });

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
