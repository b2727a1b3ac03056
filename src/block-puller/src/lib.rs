mod locked_writer;
mod progress;
mod puller_state;

pub use locked_writer::LockedWriter;
pub use progress::{blocks_to_size, PullerProgress};
pub use puller_state::{PullProgressTracker, PullerParams};
