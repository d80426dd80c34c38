//! Connection teardown

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use super::{Client, Connection};

/// Why a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseReason {
    /// Client sent DISCONNECT
    Graceful,
    /// Socket closed or failed, or a protocol violation
    Error,
    KeepAlive,
    /// A newer connection claimed the client id
    TakenOver,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Graceful => "disconnect",
            CloseReason::Error => "error",
            CloseReason::KeepAlive => "keep-alive timeout",
            CloseReason::TakenOver => "taken over",
            CloseReason::Shutdown => "shutdown",
        }
    }

    /// Only a DISCONNECT packet discards the will
    pub fn publishes_will(&self) -> bool {
        *self != CloseReason::Graceful
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Publish the will if due, close the transport and release the session
    pub(crate) async fn close(&mut self, client: &mut Client, reason: CloseReason) {
        client.retransmitter.abort();

        let will = client.will.take();
        if let Some(will) = will {
            if reason.publishes_will() {
                self.publish_will(client, will).await;
            }
        }

        if let Err(e) = self.stream.shutdown().await {
            debug!("Shutdown of {} failed: {}", self.addr, e);
        }

        self.broker
            .release_session(&client.client_id, &client.session, client.epoch, client.clean_session)
            .await;

        self.broker.metrics.client_disconnected();
        info!(
            "Client {} disconnected from {} ({})",
            client.client_id,
            self.addr,
            reason.as_str()
        );
    }
}
