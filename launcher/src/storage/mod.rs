//! Durable storage layout

pub mod layout;
