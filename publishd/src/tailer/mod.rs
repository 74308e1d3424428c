// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>
//! Follows the export tool's log file and keeps its most recent lines.
//!
//! The file itself is not watched; its parent directory is. That way the
//! tailer notices when the file appears for the first time, is rotated away,
//! and is created again.

pub mod backlog;
pub mod observer;
pub mod watch;
