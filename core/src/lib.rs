//! Claudex session runtime: PTY lifecycle, scrollback retention, activity
//! classification and session persistence. Transport concerns live in
//! `claudex-server`.

pub mod agent;
mod error;
mod layout;
mod manager;
mod pane;
mod scrollback;
mod session;
mod status;
mod tracker;

pub use error::ManagerError;
pub use error::PaneError;
pub use layout::Layout;
pub use layout::SplitDirection;
pub use manager::SessionManager;
pub use pane::AGENT_CLI;
pub use pane::AGENT_RESUME_FLAG;
pub use pane::OutputCallback;
pub use pane::Pane;
pub use pane::StatusCallback;
pub use scrollback::SCROLLBACK_MAX_BYTES;
pub use scrollback::ScrollbackBuffer;
pub use session::Customization;
pub use session::Session;
pub use session::SessionInfo;
pub use status::Status;
pub use tracker::LineEntry;
pub use tracker::StateTracker;
