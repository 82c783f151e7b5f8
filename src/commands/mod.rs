//! Command implementations for Graft CLI

pub mod completions;
pub mod context;
pub mod disable;
pub mod eject;
pub mod enable;
pub mod inject;
pub mod list;
pub mod recover;
pub mod verify;
pub mod version;
pub mod view;
