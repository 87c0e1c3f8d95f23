//! Slate HTTP server.
//!
//! Wires the content repository, session store and login guard from
//! `slate-core` into a running Axum server. Serves the JSON content API at
//! `/api/*`, server-rendered pages at `/`, and static assets at `/static`.

pub mod config;
pub mod error;
pub mod middleware;
pub mod routes;
pub mod state;
