pub mod broker;
pub mod consumer;
pub mod event;
#[cfg(test)]
mod tests;

pub use broker::MessageBroker;
pub use consumer::{DeliverySource, IncomingMessage, MessageHandler, ProcessingError, QueueConsumer};
pub use event::{EventEnvelope, EventType};
