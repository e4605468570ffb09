pub mod backend;
pub mod endpoint;
pub mod local;
pub mod object_store;
pub mod types;

pub use backend::{BackendType, DeleteOutcome, Download, Headers, StorageBackend, TransferReceipt};
pub use endpoint::Endpoint;
pub use local::LocalBackend;
pub use object_store::ObjectStoreBackend;
pub use types::*;
