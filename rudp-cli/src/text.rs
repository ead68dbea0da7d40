//! Text signals exchanged by rudp-node

use bytes::{BufMut, Bytes, BytesMut};
use crossbeam::channel::Sender;
use rudp::protocol::CodecError;
use rudp::{PeerInfo, Signal, SignalRegistry, SignalUid};
use tracing::{trace, warn};

/// Registry id of `TextSignal`
pub const TEXT_SIGNAL: u16 = 1;

/// A line received from a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incoming {
    pub peer: PeerInfo,
    pub text: String,
}

/// One line of UTF-8 text
pub struct TextSignal {
    text: String,
    inbox: Option<Sender<Incoming>>,
}

impl TextSignal {
    pub fn new(text: impl Into<String>) -> Self {
        TextSignal {
            text: text.into(),
            inbox: None,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

impl Signal for TextSignal {
    fn signal_type(&self) -> u16 {
        TEXT_SIGNAL
    }

    fn encode(&self, out: &mut BytesMut) {
        out.put_slice(self.text.as_bytes());
    }

    fn on_fully_received(self: Box<Self>, peer: &PeerInfo) -> Option<SignalUid> {
        let TextSignal { text, inbox } = *self;
        if let Some(inbox) = inbox {
            let _ = inbox.send(Incoming { peer: *peer, text });
        }
        None
    }

    fn on_send_failed(&mut self, sent_once: bool) {
        warn!(sent_once, len = self.text.len(), "text not delivered");
    }

    fn on_send_succeeded(&mut self) {
        trace!(len = self.text.len(), "text delivered");
    }
}

/// Registry decoding text signals into `inbox`
pub fn text_registry(inbox: Sender<Incoming>) -> SignalRegistry {
    let mut registry = SignalRegistry::new();
    registry.register(TEXT_SIGNAL, move |body: Bytes| {
        let text = String::from_utf8(body.to_vec())
            .map_err(|e| CodecError::Malformed(e.to_string()))?;
        Ok(Box::new(TextSignal {
            text,
            inbox: Some(inbox.clone()),
        }) as Box<dyn Signal>)
    });
    registry
}
