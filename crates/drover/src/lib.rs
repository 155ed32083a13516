//! Core primitives for driving external spectrum search engines.
//!
//! The identification tools themselves are opaque native binaries. This
//! crate owns everything around them: indexing and repairing MGF peak
//! lists before they are handed to an engine ([`validate`]), splitting
//! oversized files into worker-sized chunks ([`split`]), and
//! supervising one engine process at a time - spawning it, interpreting
//! its console output, and honoring cooperative cancellation
//! ([`process`]). All run feedback flows through a shared
//! [`progress::ProgressSink`].

pub mod mgf;
pub mod process;
pub mod progress;
pub mod split;
pub mod validate;

pub use mgf::MgfIndex;
pub use process::{OutputMode, ProcessRun, RunState};
pub use progress::ProgressSink;
pub use validate::{DuplicateTitlePolicy, MissingTitlePolicy, Validation};
