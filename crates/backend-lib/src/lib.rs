// ============================
// crates/backend-lib/src/lib.rs
// ============================
//! Core backend-lib functionality for the meetrelay signaling server.
//!
//! The server coordinates multi-party real-time sessions: it tracks
//! who is present, relays opaque peer-negotiation envelopes between
//! named participants, synchronizes media state and chat, and enforces
//! the session lifecycle. Media itself flows peer-to-peer and never
//! touches this process.

pub mod auth;
pub mod config;
pub mod error;
pub mod messages;
pub mod metrics;
pub mod registry;
pub mod session_actor;
pub mod store;
pub mod validation;
pub mod ws_router;

use std::sync::Arc;

use crate::auth::{LocalVerifier, TokenVerifier};
use crate::config::Settings;
use crate::registry::SessionRegistry;
use crate::store::Store;

/// Application state shared across all connection handlers
#[derive(Clone)]
pub struct AppState<S> {
    /// Connection gatekeeper
    pub verifier: Arc<dyn TokenVerifier>,
    /// Registry of live session actors
    pub registry: Arc<SessionRegistry>,
    /// Settings
    pub settings: Arc<Settings>,
    /// Durable-store collaborator
    pub store: S,
}

impl<S: Store + Clone + 'static> AppState<S> {
    /// Create a new application state
    pub fn new(store: S, settings: Settings) -> Self {
        let registry = Arc::new(SessionRegistry::new(
            settings.max_chat_len,
            settings.default_max_participants,
        ));
        Self {
            verifier: Arc::new(LocalVerifier::new()),
            registry,
            settings: Arc::new(settings),
            store,
        }
    }

    /// Create application state with an externally provided verifier
    pub fn with_verifier(
        store: S,
        settings: Settings,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new(
            settings.max_chat_len,
            settings.default_max_participants,
        ));
        Self {
            verifier,
            registry,
            settings: Arc::new(settings),
            store,
        }
    }
}
