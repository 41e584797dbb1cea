// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interfaces to collaborators outside of the privilege engine.
mod store;

pub use store::PrivilegeStore;
