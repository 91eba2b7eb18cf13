use futures::StreamExt;

pub use futures::channel::mpsc::{
    unbounded as channel, UnboundedReceiver as InnerReceiver, UnboundedSender as InnerSender,
};

#[derive(Debug)]
pub struct Receiver<T> {
    receiver: InnerReceiver<T>,
}

impl<T> Receiver<T> {
    pub fn new(receiver: InnerReceiver<T>) -> Self {
        Self { receiver }
    }

    /// Asynchronously receive an event. Returns `None` once the manager has shut down.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.next().await
    }

    /// Attempts to receive an event. This function is non-blocking.
    pub fn try_recv(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }
}
