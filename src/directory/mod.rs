pub mod poller;
pub mod status;

pub use poller::{AgentSource, DirectoryPoller};
pub use status::{AgentDirectory, AgentQuery, StatusReport, Transition};
