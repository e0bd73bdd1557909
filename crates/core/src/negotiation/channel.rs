use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Sender, unbounded};

use crate::error::{Result, VideoError};
use crate::events::Listeners;

pub type MessageHandler = Box<dyn Fn(&str) + Send + Sync>;

/// Reliable, ordered text channel between two peers.
///
/// Delivery happens asynchronously on whatever thread the implementation
/// chooses; there is no ordering with respect to the RTP data path.
pub trait ControlChannel: Send + Sync {
    fn send_reliable(&self, message: String) -> Result<()>;

    /// Register a handler for every message that arrives from the peer.
    fn subscribe(&self, handler: MessageHandler);
}

/// One end of an in-process control channel pair.
///
/// Messages sent on one endpoint are queued on a crossbeam channel and
/// handed to the other endpoint's subscribers by a dedicated delivery
/// thread, in send order. The thread exits once the sending endpoint is
/// dropped.
pub struct InMemoryControlChannel {
    outgoing: Sender<String>,
    listeners: Arc<Listeners<String>>,
}

impl InMemoryControlChannel {
    /// Create two connected endpoints.
    pub fn pair() -> Result<(Self, Self)> {
        let (a_tx, a_rx) = unbounded::<String>();
        let (b_tx, b_rx) = unbounded::<String>();
        let a_listeners = Arc::new(Listeners::new());
        let b_listeners = Arc::new(Listeners::new());

        for (name, rx, listeners) in [
            ("control-a", a_rx, a_listeners.clone()),
            ("control-b", b_rx, b_listeners.clone()),
        ] {
            thread::Builder::new().name(name.into()).spawn(move || {
                for message in rx.iter() {
                    listeners.emit(&message);
                }
                tracing::trace!(endpoint = name, "control delivery stopped");
            })?;
        }

        // a's outgoing feeds b's delivery thread and vice versa
        let a = Self {
            outgoing: b_tx,
            listeners: a_listeners,
        };
        let b = Self {
            outgoing: a_tx,
            listeners: b_listeners,
        };
        Ok((a, b))
    }
}

impl ControlChannel for InMemoryControlChannel {
    fn send_reliable(&self, message: String) -> Result<()> {
        tracing::trace!(len = message.len(), "control message queued");
        self.outgoing
            .send(message)
            .map_err(|_| VideoError::ChannelClosed)
    }

    fn subscribe(&self, handler: MessageHandler) {
        self.listeners.subscribe(move |message: &String| handler(message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn delivers_in_order_to_peer() {
        let (a, b) = InMemoryControlChannel::pair().unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        b.subscribe(Box::new(move |m| {
            let _ = tx.send(m.to_string());
        }));

        for i in 0..5 {
            a.send_reliable(format!("m{i}")).unwrap();
        }
        let got: Vec<String> = (0..5)
            .map(|_| rx.recv_timeout(Duration::from_secs(1)).unwrap())
            .collect();
        assert_eq!(got, ["m0", "m1", "m2", "m3", "m4"]);
    }
}
