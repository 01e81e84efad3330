//! Caller identity from the `Authorization` header
//!
//! The bearer credential is an identity token issued by the cloud platform. Its signature is
//! checked by the platform's ingress before a request reaches the server, so it is decoded here
//! without a key; expiry and (when configured) audience are still enforced.

use std::collections::HashSet;

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use log::warn;
use serde::Deserialize;

use crate::error::RunnerError;

#[derive(Clone, Debug, Default)]
pub struct AuthSettings {
    /// Expected `aud` claim, skipped when `None`
    pub audience: Option<String>,
    pub leeway_seconds: u64,
}

#[derive(Deserialize)]
struct IdentityClaims {
    email: Option<String>,
}

/// Email address of the caller, lower-cased and trimmed
///
/// A missing header is an authentication failure, anything that can't be decoded into an
/// unexpired identity with an email is an authorization failure.
pub fn email_from_headers(headers: &HeaderMap, settings: &AuthSettings) -> Result<String, RunnerError> {
    let header = headers.get(AUTHORIZATION)
        .ok_or_else(|| RunnerError::Authentication("Missing authorization header".to_string()))?;
    let header = header.to_str()
        .map_err(|_| RunnerError::Authorization("Invalid authorization header".to_string()))?;
    email_from_authorization(header, settings)
}

pub fn email_from_authorization(header: &str, settings: &AuthSettings) -> Result<String, RunnerError> {
    let invalid = || RunnerError::Authorization("Invalid authorization header".to_string());

    let token = strip_bearer(header).ok_or_else(invalid)?;

    let claims = decode::<IdentityClaims>(token, &DecodingKey::from_secret(&[]), &validation(settings))
        .map_err(|err| {
            warn!("Rejecting identity token: {err}");
            invalid()
        })?
        .claims;

    claims.email
        .map(|email| email.trim().to_lowercase())
        .filter(|email| email.contains('@'))
        .ok_or_else(invalid)
}

fn strip_bearer(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

fn validation(settings: &AuthSettings) -> Validation {
    let mut validation = Validation::new(Algorithm::RS256);
    validation.insecure_disable_signature_validation();
    validation.leeway = settings.leeway_seconds;
    validation.validate_exp = true;
    match settings.audience.as_deref() {
        Some(audience) => validation.set_audience(&[audience]),
        None => validation.validate_aud = false,
    }
    // exp and aud are only checked when the token carries them
    validation.required_spec_claims = HashSet::new();
    validation
}
