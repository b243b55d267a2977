//! Ports: the traits adapters implement and the DTOs that cross them.

pub mod notify;
pub mod remote;
pub mod store;

pub use notify::{LogNotifier, Notifier, Severity};
pub use remote::{ChangePage, FragmentOutcome, RemoteApi, RemoteItem, UploadSession};
pub use store::ItemStore;
