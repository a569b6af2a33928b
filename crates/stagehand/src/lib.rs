//! Stagehand, the deployable runtime.
//!
//! Boots with a persisted identity, negotiates its assignment with the
//! callboard, interprets the installed show-logic document, and plays media
//! on its outputs through per-output playback channels.

pub mod actions;
pub mod assets;
pub mod capabilities;
pub mod client;
pub mod engine;
pub mod playback;
pub mod runtime;
pub mod store;
pub mod web;
