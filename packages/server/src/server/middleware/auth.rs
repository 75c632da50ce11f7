//! Bearer-token extraction.
//!
//! Authentication proper is a collaborator, not part of the core: this
//! middleware is its plug-in point. The bearer token doubles as the
//! submitter token (`owner`) bound into job records; with auth disabled,
//! anonymous requests carry an empty owner.

use axum::extract::Request;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::common::ApiError;

/// Opaque submitter token attached to every API request.
#[derive(Debug, Clone, Default)]
pub struct Owner(pub String);

pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let auth = headers.get("authorization")?.to_str().ok()?;
    auth.strip_prefix("Bearer ").map(|token| token.to_string())
}

pub async fn owner_middleware(auth_enabled: bool, mut request: Request, next: Next) -> Response {
    let token = bearer_token(request.headers()).unwrap_or_default();
    if auth_enabled && token.is_empty() {
        return ApiError::Unauthorized.into_response();
    }
    request.extensions_mut().insert(Owner(token));
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn extracts_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer tok-123"));
        assert_eq!(bearer_token(&headers).as_deref(), Some("tok-123"));
    }

    #[test]
    fn ignores_non_bearer_schemes() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Basic dXNlcg=="));
        assert!(bearer_token(&headers).is_none());
    }

    #[test]
    fn missing_header_yields_none() {
        assert!(bearer_token(&HeaderMap::new()).is_none());
    }
}
