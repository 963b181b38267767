//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use authkeep_core::{
    Config, CredentialPair, CredentialStore, HttpAuthBackend, MemoryCredentialStore,
    SessionManager, StoreBackend,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use reqwest::Client;
use wiremock::MockServer;

/// Unsigned three-segment token for `username`, expiring `offset_secs` from now.
pub fn token(username: &str, offset_secs: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = serde_json::json!({
        "token_type": "access",
        "exp": Utc::now().timestamp() + offset_secs,
        "jti": format!("{username}-{offset_secs}"),
        "user_id": 42,
        "username": username,
        "email": format!("{username}@example.com"),
        "role": "user",
    });
    let body = URL_SAFE_NO_PAD.encode(payload.to_string());
    format!("{header}.{body}.c2lnbmF0dXJl")
}

pub fn bearer(token: &str) -> String {
    format!("Bearer {token}")
}

pub fn config_for(server: &MockServer) -> Config {
    Config {
        base_url: server.uri(),
        store: StoreBackend::Memory,
        ..Config::default()
    }
}

/// Manager talking to `server`, backed by `store`.
pub fn manager_with_store(server: &MockServer, store: Arc<dyn CredentialStore>) -> SessionManager {
    let config = config_for(server);
    let client = Client::new();
    let backend = Arc::new(HttpAuthBackend::new(client.clone(), &config));
    SessionManager::with_parts(&config, client, store, backend)
}

/// Manager with an in-memory store already holding `pair`.
pub fn signed_in_manager(
    server: &MockServer,
    pair: CredentialPair,
) -> (SessionManager, Arc<MemoryCredentialStore>) {
    let store = Arc::new(MemoryCredentialStore::new());
    let manager = manager_with_store(server, store.clone());
    manager.session().commit(pair);
    (manager, store)
}
