// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>
//! # Design: Sequential Publish Runner
//!
//! ## Overview
//! Publish requests are serialized through one bounded queue and executed
//! strictly one after another by a single async loop.
//!
//! - `TaskQueue` is the only admission control: a full queue rejects new work.
//! - The `Publisher` loop is the only consumer. Per task it refreshes the
//!   payload, renders the parameter file into a temporary directory, and runs
//!   the export tool in its own process group.
//! - A `PublisherHandle` is what the rest of the service holds. It enqueues,
//!   removes, terminates the running export, and reports status.
//! - A failing task is logged and dropped; the loop always picks up the next.
//!
//!         +--------------------+       publish / remove / clear
//!         |  PublisherHandle   | <-----------------------------+
//!         +---------+----------+                               |
//!                   | push                                     |
//!                   v                                          |
//!         +--------------------+   pop    +------------------------------+
//!         |     TaskQueue      | -------> |        Publisher loop        |
//!         +--------------------+          | Idle -> Refreshing -> Running|
//!                                         +---------------+--------------+
//!                                                         | setsid + exec
//!                                                         v
//!                                                 +---------------+
//!                                                 |  export tool  |
//!                                                 +---------------+

pub mod process_group;
pub mod publisher;
pub mod queue;
pub mod task;
