//! Action workers: long-lived units that are not bound to a device.

mod cleaner;
mod writer;

pub use cleaner::{Cleaner, PurgeReport};
pub use writer::{Writer, ARTIFACT_PREFIX};

/// Action name of the [`Writer`].
pub const WRITER: &str = "writer";

/// Action name of the [`Cleaner`].
pub const CLEANER: &str = "cleaner";
