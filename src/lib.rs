//! Client-side realtime chat synchronization engine.
//!
//! Merges an initial bulk load, a live change feed, and local optimistic
//! writes into one consistent view of a conversation's messages, threads,
//! attachments and reactions. Start with [`ChatSession`].

pub mod backend;
pub mod cache;
pub mod cli;
pub mod clock;
pub mod config;
pub mod feed;
pub mod hydration;
pub mod ingest;
mod journal;
pub mod loader;
pub mod logging;
pub mod model;
pub mod optimistic;
pub mod pending;
pub mod realtime;
pub mod reconciler;
pub mod rest;
pub mod scheduler;
pub mod session;
pub mod view;

pub use optimistic::ReactionToggle;
pub use session::{ChatSession, Collaborators, SessionEvent, SyncError, UserContext};
pub use view::ChatView;
