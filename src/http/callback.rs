//! The authorization-code callback endpoint.
//!
//! The IdP redirects the user's browser here after authentication. The
//! handler walks a fixed validation ladder — IdP error, missing
//! parameters, state validation, state integrity, code exchange — and
//! renders a generic page at the first failed rung. Failure pages never
//! echo IdP-provided text; specifics go to the log at debug level.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Response,
};
use serde::Deserialize;

use super::{escape_html, html_page};
use crate::{manager::ProxyInner, store::token::TokenKey};

/// Query parameters the IdP may send to the callback.
#[derive(Debug, Deserialize)]
pub(crate) struct CallbackQuery {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

fn error_page(title: &str, message: &str) -> Response {
    html_page(StatusCode::BAD_REQUEST, title, message)
}

#[tracing::instrument(name = "oauth.callback", skip_all)]
pub(crate) async fn callback(
    State(proxy): State<Arc<ProxyInner>>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    if let Some(error) = &query.error {
        // The description can reflect attacker-controlled input; keep it
        // out of the page.
        tracing::debug!(
            error = %error,
            error_description = ?query.error_description,
            "identity provider reported an error"
        );
        return error_page(
            "Authentication Failed",
            "Authentication was denied or failed.",
        );
    }

    let (Some(code), Some(state)) = (query.code.as_deref(), query.state.as_deref()) else {
        return error_page(
            "Authentication Failed",
            "The callback request is missing required parameters.",
        );
    };

    let Some(auth_state) = proxy.client.states().validate_state(state).await else {
        return error_page(
            "Session Expired",
            "Your authentication session has expired or was already used. Please try again.",
        );
    };

    if auth_state.issuer.is_empty() || auth_state.code_verifier.is_empty() {
        tracing::warn!(server_name = %auth_state.server_name, "authorization state is incomplete");
        return error_page(
            "Session Invalid",
            "Your authentication session is invalid. Please try again.",
        );
    }

    let token = match proxy
        .client
        .exchange_code(code, &auth_state.code_verifier, &auth_state.issuer)
        .await
    {
        Ok(token) => token,
        Err(err) => {
            tracing::warn!(
                error = %err,
                issuer = %auth_state.issuer,
                server_name = %auth_state.server_name,
                "authorization code exchange failed"
            );
            return error_page(
                "Authentication Failed",
                "Failed to complete authentication. Please try again.",
            );
        }
    };

    let key = TokenKey::new(
        auth_state.session_id.clone(),
        auth_state.issuer.clone(),
        token.scope.clone(),
    );
    proxy.client.tokens().store(key, token.clone()).await;
    tracing::info!(
        server_name = %auth_state.server_name,
        issuer = %auth_state.issuer,
        "authentication completed"
    );

    // The token is stored either way: a failing hook must not make the
    // user redo a flow that already succeeded.
    let completion = proxy.completion.read().await.clone();
    if let Some(hook) = completion {
        if let Err(err) = hook(
            auth_state.session_id.clone(),
            auth_state.server_name.clone(),
            token.access_token.clone(),
        )
        .await
        {
            tracing::warn!(
                error = %err,
                server_name = %auth_state.server_name,
                "auth completion callback failed"
            );
        }
    }

    let server_name = escape_html(&auth_state.server_name);
    html_page(
        StatusCode::OK,
        "Authentication Successful",
        &format!("You are now signed in to <strong>{server_name}</strong>. You can close this window."),
    )
}
