//! The self-hosted Client ID Metadata Document.
//!
//! When no pre-registered client id is configured, the proxy publishes an
//! RFC 7591-shaped document describing itself as a public client; the
//! document's own URL doubles as the client id. IdPs fetch it anonymously,
//! hence the permissive CORS and cache headers.

use std::sync::Arc;

use axum::{Json, extract::State, response::IntoResponse};
use serde::Serialize;

use crate::manager::ProxyInner;

/// RFC 7591-shaped client metadata.
#[derive(Debug, Serialize)]
pub(crate) struct ClientMetadataDocument {
    pub client_id: String,
    pub client_name: String,
    pub client_uri: String,
    pub redirect_uris: Vec<String>,
    pub grant_types: Vec<String>,
    pub response_types: Vec<String>,
    pub token_endpoint_auth_method: String,
    pub scope: String,
    pub software_id: String,
    pub software_version: String,
}

#[tracing::instrument(name = "oauth.cimd", skip_all)]
pub(crate) async fn client_metadata(State(proxy): State<Arc<ProxyInner>>) -> impl IntoResponse {
    let config = &proxy.config;
    let document = ClientMetadataDocument {
        client_id: config.effective_client_id(),
        client_name: config.client_name.clone(),
        client_uri: config.public_url.clone(),
        redirect_uris: vec![config.redirect_uri()],
        grant_types: vec![
            "authorization_code".to_string(),
            "refresh_token".to_string(),
        ],
        response_types: vec!["code".to_string()],
        token_endpoint_auth_method: "none".to_string(),
        scope: config.cimd_scopes.clone(),
        software_id: env!("CARGO_PKG_NAME").to_string(),
        software_version: env!("CARGO_PKG_VERSION").to_string(),
    };

    (
        [
            ("Access-Control-Allow-Origin", "*"),
            ("Cache-Control", "public, max-age=3600"),
        ],
        Json(document),
    )
}
