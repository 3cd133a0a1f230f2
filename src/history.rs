//! Sink for assembled history pages

use tokio::sync::mpsc;

use crate::types::Message;

/// Receives every multi-frame response once it is fully assembled.
///
/// Called on the dispatcher task; implementations must not block.
pub trait HistorySink: Send + 'static {
    fn record(&mut self, message: &Message);
}

impl HistorySink for mpsc::UnboundedSender<Message> {
    fn record(&mut self, message: &Message) {
        let _ = self.send(message.clone());
    }
}
