use axum::{
    async_trait,
    extract::{FromRequestParts, State},
    http::{request::Parts, StatusCode},
    response::Json,
};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::models::{AuthLevel, Controller, SectionId};
use crate::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Controller id.
    pub sub: String,
    pub employee_id: String,
    pub level: AuthLevel,
    pub sections: Vec<SectionId>,
    pub exp: usize,
    pub iat: usize,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub employee_id: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub controller_id: String,
    pub auth_level: AuthLevel,
    pub expires_at: DateTime<Utc>,
}

/// Session token management for controller principals.
pub struct AuthService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    token_expiry_hours: u64,
}

impl AuthService {
    pub fn new(secret: &str, token_expiry_hours: u64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_ref()),
            decoding_key: DecodingKey::from_secret(secret.as_ref()),
            token_expiry_hours,
        }
    }

    pub fn generate_token(&self, controller: &Controller) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now();
        let exp = (now + Duration::hours(self.token_expiry_hours as i64)).timestamp() as usize;
        let claims = Claims {
            sub: controller.id.clone(),
            employee_id: controller.employee_id.clone(),
            level: controller.auth_level,
            sections: controller.section_responsibility.clone(),
            exp,
            iat: now.timestamp() as usize,
        };
        encode(&Header::default(), &claims, &self.encoding_key)
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        let validation = Validation::new(Algorithm::HS256);
        let token_data = decode::<Claims>(token, &self.decoding_key, &validation)?;
        Ok(token_data.claims)
    }
}

/// Extractor for protected routes: validates the bearer token, then loads the
/// controller so revoked or deactivated principals are refused even with a
/// live token.
pub struct AuthenticatedController(pub Controller);

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedController {
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get("authorization")
            .and_then(|h| h.to_str().ok())
            .ok_or(StatusCode::UNAUTHORIZED)?;
        let token = auth_header
            .strip_prefix("Bearer ")
            .ok_or(StatusCode::UNAUTHORIZED)?;

        let claims = state
            .auth_service
            .validate_token(token)
            .map_err(|_| StatusCode::UNAUTHORIZED)?;

        let controller = state
            .store
            .get_controller(&claims.sub)
            .await
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
            .ok_or(StatusCode::UNAUTHORIZED)?;
        if !controller.active {
            return Err(StatusCode::UNAUTHORIZED);
        }
        Ok(AuthenticatedController(controller))
    }
}

/// Login endpoint: exchanges employee credentials for a session token.
pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, StatusCode> {
    tracing::info!("login attempt for employee {}", request.employee_id);

    let controller = state
        .store
        .find_controller_by_employee(&request.employee_id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .filter(|c| c.active && c.verify_password(&request.password));

    match controller {
        Some(controller) => {
            let token = state
                .auth_service
                .generate_token(&controller)
                .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
            tracing::info!("controller {} logged in", controller.id);
            let expiry_hours = state.config.security.jwt_expiry_hours as i64;
            Ok(Json(LoginResponse {
                token,
                controller_id: controller.id.clone(),
                auth_level: controller.auth_level,
                expires_at: Utc::now() + Duration::hours(expiry_hours),
            }))
        }
        None => {
            tracing::warn!("invalid credentials for employee {}", request.employee_id);
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trip_preserves_claims() {
        let service = AuthService::new("test-secret-key-at-least-32-chars!!", 12);
        let mut controller = Controller::new("CTR001", "EMP-7", AuthLevel::Supervisor, "pw");
        controller.section_responsibility = vec![7, 12];

        let token = service.generate_token(&controller).unwrap();
        let claims = service.validate_token(&token).unwrap();

        assert_eq!(claims.sub, "CTR001");
        assert_eq!(claims.employee_id, "EMP-7");
        assert_eq!(claims.level, AuthLevel::Supervisor);
        assert_eq!(claims.sections, vec![7, 12]);
    }

    #[test]
    fn foreign_secret_is_rejected() {
        let issuer = AuthService::new("test-secret-key-at-least-32-chars!!", 12);
        let verifier = AuthService::new("another-secret-key-of-32-chars!!!!!!", 12);
        let controller = Controller::new("CTR001", "EMP-7", AuthLevel::Operator, "pw");
        let token = issuer.generate_token(&controller).unwrap();
        assert!(verifier.validate_token(&token).is_err());
    }
}
