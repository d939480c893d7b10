//! Geometry constants for the VGA text-mode buffer.

/// Number of character columns in VGA text mode.
pub const BUFFER_WIDTH: usize = 80;
/// Number of character rows in VGA text mode.
pub const BUFFER_HEIGHT: usize = 25;
