//! Inventory storage for groups and nodes.
//!
//! The [`Inventory`] trait is the seam between the console and persistence;
//! [`JsonInventory`] keeps everything in one JSON document on disk.

mod json;
mod traits;

pub use json::JsonInventory;
pub use traits::Inventory;
