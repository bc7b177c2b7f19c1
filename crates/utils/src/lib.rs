//! Helpers shared by every binary in the workspace: log formatting and the
//! build-stamped version string.

mod build_info;
pub mod logging;
pub mod version;
