mod platform;
mod store;

pub use platform::MemoryPlatform;
pub use store::{MemoryAdminStore, StoreSnapshot};
