use crate::error::AppError;
use axum::extract::{FromRef, FromRequestParts};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use std::future::Future;
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// Bearer token that grants the admin role. `None` disables the admin endpoints entirely.
#[derive(Debug, Clone, Default)]
pub struct AdminToken(pub Option<Arc<str>>);

impl AdminToken {
    pub fn new(token: Option<String>) -> Self {
        Self(token.filter(|t| !t.trim().is_empty()).map(Arc::from))
    }

    fn accepts(&self, presented: &str) -> bool {
        match &self.0 {
            Some(expected) => bool::from(expected.as_bytes().ct_eq(presented.as_bytes())),
            None => false,
        }
    }
}

/// Extractor guarding admin-only routes.
#[derive(Debug, Clone, Copy)]
pub struct AdminUser;

impl<S> FromRequestParts<S> for AdminUser
where
    AdminToken: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> impl Future<Output = Result<Self, Self::Rejection>> + Send {
        let expected = AdminToken::from_ref(state);
        let result = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| expected.accepts(token))
            .map(|_| AdminUser)
            .ok_or_else(|| AppError::unauthorized("Admin role required"));
        async move { result }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_comparison_requires_exact_match() {
        let token = AdminToken::new(Some("let-me-in".to_string()));
        assert!(token.accepts("let-me-in"));
        assert!(!token.accepts("let-me-i"));
        assert!(!token.accepts(""));
    }

    #[test]
    fn blank_token_disables_admin() {
        let token = AdminToken::new(Some("   ".to_string()));
        assert!(!token.accepts("   "));
        assert!(!AdminToken::default().accepts("anything"));
    }
}
