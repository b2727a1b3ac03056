mod delete_queue;
mod folder_recvonly;

pub use delete_queue::{DeleteQueue, DeletionHandler, ScanSink};
pub use folder_recvonly::{FolderScanner, FolderState, ReceiveOnlyFolder, RevertSummary};
