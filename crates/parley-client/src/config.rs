//! Client configuration.

use parley_proto::UserRef;

/// Endpoints and identity for one client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the REST API, e.g. `https://host/api`.
    pub base_url: String,
    /// Websocket endpoint URL, e.g. `wss://host/ws`.
    pub ws_url: String,
    /// Attach the bearer credential as an `access_token` query parameter on
    /// the websocket handshake instead of an `Authorization` header. Some
    /// transports cannot carry custom headers.
    pub auth_in_query: bool,
    /// The local user, used as the author of optimistic messages.
    pub user: UserRef,
}

impl ClientConfig {
    /// Configuration with header-based websocket authentication.
    pub fn new(base_url: impl Into<String>, ws_url: impl Into<String>, user: UserRef) -> Self {
        Self { base_url: base_url.into(), ws_url: ws_url.into(), auth_in_query: false, user }
    }
}
