//! Event-driven feed maintenance and live fan-out.
//!
//! Write paths publish domain events through [`NotificationPublisher`]. The
//! [`FeedUpdater`] consumes them, recomputes cached feeds and publishes a
//! [`kinfeed_api_types::FeedUpdate`] per affected user, which the
//! [`LiveUpdateMultiplexer`] forwards to that user's open connections.

mod multiplexer;
mod notifier;
mod topics;
mod updater;

pub use multiplexer::{LiveSubscription, LiveUpdateMultiplexer, MultiplexError};
pub use notifier::{NotificationPublisher, NotifyError};
pub use topics::UserTopics;
pub use updater::{FeedUpdater, UpdateError};
