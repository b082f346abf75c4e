pub mod webhook;

pub use webhook::{CompletedNotice, FailedNotice, NoopNotifier, NotificationSink, WebhookNotifier};
