//! Chunk delivery to recipients.

mod notifier;
mod transport;

pub use notifier::{Notifier, NotifyOutcome, SUBJECT_LINE, compose_body};
pub use transport::{
    LogTransport, NotificationTransport, TransportError, WebhookAuth, WebhookConfig,
    WebhookTransport,
};
