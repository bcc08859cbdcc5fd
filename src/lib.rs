//! exodus-rsync: an exodus-aware rsync replacement.
//!
//! Accepts the rsync command-line surface, but publishes content through
//! the exodus-gw content gateway instead of (or alongside) a host-to-host
//! transfer. The crate is organized by concern:
//!
//! - `args` - rsync-compatible argument parsing
//! - `conf` - YAML configuration with per-environment overlays
//! - `walk` - source tree walker with filtering and content hashing
//! - `gw` - exodus-gw HTTP client: uploads, publishes, tasks
//! - `rsync` - integration with the real rsync command
//! - `cmd` - mode dispatch and the publish pipelines
//! - `diag` - diagnostics dump

pub mod args;
pub mod cmd;
pub mod conf;
pub mod diag;
pub mod gw;
pub mod rsync;
pub mod walk;
pub mod webpath;
