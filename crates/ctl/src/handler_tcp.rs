//! TCP control handler
//!
//! Multiple clients share one TCP handler, so every connection gets a
//! 64-bit session mask `(ipv4 << 32) | (port << 16)`. Inbound msg ids are
//! rewritten to `(id & 0xFFFF_FFFF) | mask` so the command cache stays
//! unique across clients; the connection writer XORs the mask away again,
//! so each client only ever sees its own ids.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::handler::{Handler, HandlerCore};
use crate::message::Message;

/// TCP transport handler, one per listening address.
pub struct TcpCtlHandler {
    core: Arc<HandlerCore>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
}

impl TcpCtlHandler {
    /// Bind the listening socket; accepting starts with [`Handler::start`].
    pub async fn bind(conn: &str) -> Result<Self> {
        let listener = TcpListener::bind(conn).await?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            core: Arc::new(HandlerCore::new(format!("ctl_tcp_{conn}"))),
            listener: Mutex::new(Some(listener)),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl Handler for TcpCtlHandler {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn conn_name(&self) -> String {
        format!("tcp://{}", self.local_addr)
    }

    fn conn_count(&self) -> usize {
        self.core.conn_count()
    }

    fn init(&self, cancel: CancellationToken, broadcast: broadcast::Receiver<Arc<Message>>) {
        self.core.init(cancel, broadcast);
    }

    async fn start(&self) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or_else(|| Error::HandlerUnavailable(self.name().to_string()))?;

        self.core.spawn_dispatch();

        let core = Arc::clone(&self.core);
        let handle = tokio::spawn(accept_loop(core, listener));
        self.core.track(handle);

        info!(addr = %self.local_addr, "tcp ctl handler started");

        Ok(())
    }

    fn commands(&self) -> Option<mpsc::Receiver<Message>> {
        self.core.take_commands()
    }

    async fn publish(&self, msg: Arc<Message>, budget: Duration) -> Result<()> {
        self.core.publish(msg, budget).await
    }

    fn release(&self) {
        self.core.release();
    }

    async fn join(&self) {
        self.core.join().await;
    }
}

async fn accept_loop(core: Arc<HandlerCore>, listener: TcpListener) {
    let cancel = core.cancel_token();

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                let Some(mask) = session_mask(&peer) else {
                    warn!(peer = %peer, "non-IPv4 peer rejected");
                    continue;
                };

                let _ = stream.set_nodelay(true);
                let (read, write) = stream.into_split();
                let key = peer.to_string();

                let epoch = core.add_connection(key.clone(), mask, write);

                let reader =
                    tokio::spawn(Arc::clone(&core).run_conn_reader(key, epoch, mask, read));
                core.track(reader);

                info!(peer = %peer, "tcp ctl client connected");
            }
            Err(err) => {
                error!(error = %err, "accept tcp client failed");
            }
        }
    }
}

/// Session mask of one peer: `(ipv4 << 32) | (port << 16)`.
fn session_mask(peer: &SocketAddr) -> Option<u64> {
    let ip = match peer.ip() {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(v6) => v6.to_ipv4_mapped()?,
    };

    Some((u64::from(u32::from_le_bytes(ip.octets())) << 32) | (u64::from(peer.port()) << 16))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_mask_layout() {
        let peer: SocketAddr = "127.0.0.1:4100".parse().unwrap();
        let mask = session_mask(&peer).unwrap();

        let ip = u32::from_le_bytes([127, 0, 0, 1]);
        assert_eq!(mask, (u64::from(ip) << 32) | (4100u64 << 16));
    }

    #[test]
    fn test_session_mask_round_trips_msg_id() {
        let peer: SocketAddr = "10.0.0.2:50001".parse().unwrap();
        let mask = session_mask(&peer).unwrap();

        let client_id: u64 = 7;
        let masked = (client_id & 0xFFFF_FFFF) | mask;
        assert_ne!(masked, client_id);
        assert_eq!(masked ^ mask, client_id);
    }

    #[test]
    fn test_session_masks_differ_per_port() {
        let a = session_mask(&"127.0.0.1:4100".parse().unwrap()).unwrap();
        let b = session_mask(&"127.0.0.1:4101".parse().unwrap()).unwrap();
        assert_ne!(a, b);
    }
}
