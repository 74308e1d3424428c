// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! Collaborators the publisher consumes but does not own: the data source that
//! refreshes a payload right before use, and the renderer that turns it into
//! the export tool's parameter file.

pub mod data_source;
pub mod template;
