//! SSH client handler shared by every connection.
//!
//! `SshClientHandler` accepts all host keys, similar to
//! `StrictHostKeyChecking=no` in OpenSSH. Fleet inventories are addressed by
//! IP and re-imaged often, so pinning keys per address is left to the
//! operator's network.
//!
//! The `client::Handle<SshClientHandler>` is wrapped in `Arc<>` by the shell
//! because it is not `Clone` and the push path opens extra channels on it.

use russh::{client, keys};
use tracing::trace;

/// Client handler for russh that accepts all host keys.
pub struct SshClientHandler;

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        trace!("Accepting server key {:?}", server_public_key.algorithm());
        Ok(true)
    }
}
