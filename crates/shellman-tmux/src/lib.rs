//! tmux integration: command executor, capability facade with real and
//! in-memory variants, the control-mode (`tmux -C`) subscription hub, and
//! pane process inspection.

pub mod control;
pub mod error;
pub mod executor;
pub mod facade;
pub mod fake;
pub mod hub;
pub mod process;

pub use error::TmuxError;
pub use executor::TmuxExecutor;
pub use facade::{CursorPos, PaneListing, RealTmux, TmuxFacade};
pub use fake::FakeTmux;
pub use hub::{ControlModeHub, ControlSubscription};
