pub mod clock;
pub mod error;
pub mod model;
pub mod registry;
pub mod routes;
pub mod store;
pub mod utils;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::LinkError;
pub use model::{LinkRecord, LinkSummary};
pub use registry::LinkRegistry;
pub use store::{FileStore, KeyValueStore, MemoryStore, StorageError};
