//! Job status events and their fan-out to listeners.

pub mod board;
pub mod error;
pub mod event;
pub mod hub;
pub mod traits;

pub use board::{StatusBoard, StatusSnapshot};
pub use error::StatusError;
pub use event::{JobStatus, StatusEvent};
pub use hub::{BroadcastHub, HubSubscription};
pub use traits::{StatusPublisher, StatusSubscriber};
