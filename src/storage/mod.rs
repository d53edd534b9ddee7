//! Local Storage Module
//!
//! The on-disk half of the node: fixed-size block files in a shared
//! directory, with a byte-accurate usage counter. Placement and replication
//! decisions happen elsewhere; this layer only reads, writes and deletes the
//! blocks assigned to this node.

pub mod blocks;

#[cfg(test)]
mod tests;
