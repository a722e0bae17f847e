pub mod convergence;
pub mod marker;
pub mod reconciler;
pub mod watcher;

pub use convergence::{Converger, ProvisionError, Step};
pub use marker::{MarkOutcome, StateMarker};
pub use reconciler::{ProvisionOutcome, Reconciler};
pub use watcher::Watcher;
