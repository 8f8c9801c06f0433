//! Client sessions and in-flight request tracking.

pub mod client;
pub mod listener;
pub mod tracker;

pub use client::{NotificationHandler, Session};
pub use listener::{SessionListener, SessionState};
pub use tracker::{PendingRequests, PendingResponse};
