//! Ingress reader — pulls RTP off the inbound track onto the forwarding
//! queue.

use std::sync::Arc;

use rtp::packet::Packet;
use tokio::sync::mpsc;

use super::ports::RemoteTrack;

/// Read packets one at a time and enqueue them for the forwarder.
///
/// End of stream ends the loop cleanly; any other read error surfaces to the
/// caller. No ordering or validation happens here — the forwarder owns
/// policy.
pub(crate) async fn pump(
    track: Arc<dyn RemoteTrack>,
    queue: mpsc::Sender<Packet>,
) -> anyhow::Result<()> {
    loop {
        match track.read_rtp().await? {
            Some(packet) => {
                // The forwarder dropping its end is a normal shutdown.
                if queue.send(packet).await.is_err() {
                    return Ok(());
                }
            }
            None => return Ok(()),
        }
    }
}
