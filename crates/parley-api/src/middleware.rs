use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
};
use axum_extra::extract::cookie::CookieJar;
use jsonwebtoken::{decode, DecodingKey, Validation};

use parley_types::api::Claims;

use crate::auth::AppState;

/// Extract and validate the JWT from the Authorization header, falling back
/// to the `auth-token` cookie (browser clients keep it HttpOnly). All
/// failure modes reject identically. The secret comes from shared state —
/// the same value token issuance and the gateway use — so the three can
/// never drift. Install with `middleware::from_fn_with_state`.
pub async fn require_auth(
    State(state): State<AppState>,
    jar: CookieJar,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let bearer = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.to_string());

    let token = bearer
        .or_else(|| jar.get("auth-token").map(|c| c.value().to_string()))
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let token_data = decode::<Claims>(
        &token,
        &DecodingKey::from_secret(state.jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| StatusCode::UNAUTHORIZED)?;

    req.extensions_mut().insert(token_data.claims);
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AppStateInner;
    use axum::{body::Body, http::Request as HttpRequest, middleware, routing::get, Router};
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::sync::Arc;
    use tower::ServiceExt;
    use uuid::Uuid;

    fn test_state(secret: &str) -> AppState {
        Arc::new(AppStateInner {
            db: Arc::new(parley_db::Database::open_in_memory().unwrap()),
            jwt_secret: secret.to_string(),
        })
    }

    fn make_token(secret: &str) -> String {
        let claims = Claims {
            sub: Uuid::new_v4(),
            name: "Alice".to_string(),
            exp: (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp() as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn router(state: AppState) -> Router {
        Router::new()
            .route("/protected", get(|| async { StatusCode::OK }))
            .layer(middleware::from_fn_with_state(state.clone(), require_auth))
            .with_state(state)
    }

    #[tokio::test]
    async fn accepts_only_tokens_signed_with_the_state_secret() {
        let app = router(test_state("state-secret"));

        let ok = app
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .uri("/protected")
                    .header(header::AUTHORIZATION, format!("Bearer {}", make_token("state-secret")))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);

        // A token minted against any other secret — including the dev
        // fallback an env-reading middleware would accept — is rejected.
        let stale = app
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .uri("/protected")
                    .header(
                        header::AUTHORIZATION,
                        format!("Bearer {}", make_token("dev-secret-change-me")),
                    )
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(stale.status(), StatusCode::UNAUTHORIZED);

        let missing = app
            .oneshot(HttpRequest::builder().uri("/protected").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn cookie_fallback_uses_the_same_secret() {
        let app = router(test_state("state-secret"));

        let via_cookie = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/protected")
                    .header(
                        header::COOKIE,
                        format!("auth-token={}", make_token("state-secret")),
                    )
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(via_cookie.status(), StatusCode::OK);
    }
}
