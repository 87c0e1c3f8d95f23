//! Core library for Slate.
//!
//! Contains the content model, the shared-mode content store, the seed
//! loader, the session layer contract, the per-session content projector,
//! the mode-independent content repository, and the login guard. This crate
//! depends on `slate-storage` for the storage backend trait and knows
//! nothing about HTTP.

pub mod content;
pub mod envelope;
pub mod error;
pub mod login;
pub mod projector;
pub mod repository;
pub mod seed;
pub mod session;
pub mod store;
