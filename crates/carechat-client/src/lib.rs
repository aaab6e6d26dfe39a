//! Client-side messaging core: optimistic sends, reconciliation with the
//! persistence API, live delivery and the conversation directory.
//!
//! Presentation shells drive a [`ChatClient`] and render the view-models in
//! [`presentation`], refreshing on [`ChatUpdate`]s.

pub mod api;
pub mod client;
pub mod config;
pub mod directory;
mod engine;
pub mod events;
pub mod message_store;
pub mod presentation;
pub mod session;

#[cfg(test)]
mod testing;

pub use api::{DirectorySource, HttpApi, PersistenceApi};
pub use client::ChatClient;
pub use config::ClientConfig;
pub use directory::{eligible_roles, list_counterparties, ConversationDirectory, RoleFilter};
pub use events::ChatUpdate;
pub use message_store::{ChatMessage, Draft, MessageStatus, MessageStore};
pub use presentation::{ConnectionBanner, ConversationView, CounterpartyView, MessageView};
pub use session::{LocalUser, Session};
