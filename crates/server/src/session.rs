use anyhow::{Context, Result};
use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use harmony_crypto::{
    generate_signing_key, sign_message, signature_from_base64, signing_key_from_base64,
    verify_signature, verifying_key_from, SigningKey, VerifyingKey,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{chats::ErrorBody, config::SessionConfig, AppState};

/// Query parameter accepted in place of the header on WebSocket upgrades.
const TOKEN_QUERY_PARAM: &str = "token";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    pub user_id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("malformed bearer token")]
    Malformed,
    #[error("token signature does not verify")]
    BadSignature,
    #[error("token expired")]
    Expired,
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let body = ErrorBody::new("unauthorized", self.to_string());
        (StatusCode::UNAUTHORIZED, Json(body)).into_response()
    }
}

/// Issues and verifies `payload.signature` bearer tokens, both parts
/// URL-safe base64, the payload being JSON [`SessionClaims`].
#[derive(Clone)]
pub struct SessionSigner {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl SessionSigner {
    pub fn from_config(config: &SessionConfig) -> Result<Self> {
        let signing_key = match config.signing_key.as_deref() {
            Some(raw) => signing_key_from_base64(raw)
                .context("failed to load session signing key from configuration")?,
            None => generate_signing_key(),
        };
        Ok(Self::new(signing_key))
    }

    pub fn new(signing_key: SigningKey) -> Self {
        let verifying_key = verifying_key_from(&signing_key);
        Self {
            signing_key,
            verifying_key,
        }
    }

    pub fn verifying_key_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.verifying_key.as_bytes())
    }

    pub fn issue(&self, user_id: &str, ttl: Duration) -> Result<String> {
        self.sign(&SessionClaims {
            user_id: user_id.to_string(),
            expires_at: Utc::now() + ttl,
        })
    }

    pub fn sign(&self, claims: &SessionClaims) -> Result<String> {
        let payload = serde_json::to_vec(claims)?;
        let signature = sign_message(&self.signing_key, &payload);
        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        ))
    }

    pub fn verify(&self, token: &str) -> Result<SessionClaims, SessionError> {
        let (payload, signature) = token.trim().split_once('.').ok_or(SessionError::Malformed)?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| SessionError::Malformed)?;
        let signature = signature_from_base64(signature).map_err(|_| SessionError::Malformed)?;
        verify_signature(&self.verifying_key, &payload, &signature)
            .map_err(|_| SessionError::BadSignature)?;

        let claims: SessionClaims =
            serde_json::from_slice(&payload).map_err(|_| SessionError::Malformed)?;
        if claims.expires_at <= Utc::now() {
            return Err(SessionError::Expired);
        }
        Ok(claims)
    }
}

/// The caller identified by a verified bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: String,
}

fn bearer_token(parts: &Parts) -> Option<String> {
    if let Some(header) = parts.headers.get(AUTHORIZATION) {
        return header
            .to_str()
            .ok()
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::to_string);
    }
    parts.uri.query().and_then(|query| {
        query.split('&').find_map(|pair| {
            pair.strip_prefix(TOKEN_QUERY_PARAM)
                .and_then(|rest| rest.strip_prefix('='))
                .map(str::to_string)
        })
    })
}

impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = SessionError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts).ok_or(SessionError::MissingToken)?;
        let claims = state.session().verify(&token).map_err(|err| {
            tracing::debug!(%err, "rejected bearer token");
            err
        })?;
        Ok(AuthenticatedUser {
            user_id: claims.user_id,
        })
    }
}
