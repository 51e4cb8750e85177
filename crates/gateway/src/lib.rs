//! Gateway: HTTP send API, operator control channel and health endpoint.
//!
//! Lifecycle:
//! 1. Open the session store
//! 2. Build the connection manager around the configured connector
//! 3. Start the WhatsApp connection
//! 4. Serve HTTP + WebSocket until ctrl-c, then shut the connection down

pub mod http;
pub mod server;
pub mod state;
pub mod ws;

#[cfg(test)]
mod test_support;
