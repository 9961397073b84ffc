// Network seams of the session core: the peer transport and the offline relay.

pub mod relay;
pub mod transport;

pub use relay::{FetchEntry, FetchResponse, PushForm, RelayError, RelayHttpClient};
pub use transport::{ChannelTransport, OutboundEnvelope, Recipient, Transport, TransportError};
