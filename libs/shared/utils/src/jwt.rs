use chrono::{TimeZone, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use tracing::debug;
use uuid::Uuid;

use shared_models::auth::{JwtClaims, User};

pub fn validate_token(token: &str, jwt_secret: &str) -> Result<User, String> {
    if jwt_secret.is_empty() {
        return Err("JWT secret is not set".to_string());
    }

    let mut validation = Validation::new(Algorithm::HS256);
    // Supabase sets aud to "authenticated"; role scoping happens in the
    // capability predicates, not here
    validation.validate_aud = false;

    let data = decode::<JwtClaims>(
        token,
        &DecodingKey::from_secret(jwt_secret.as_bytes()),
        &validation,
    )
    .map_err(|e| {
        debug!("Token validation failed: {}", e);
        match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => "Token expired".to_string(),
            jsonwebtoken::errors::ErrorKind::InvalidSignature => {
                "Invalid token signature".to_string()
            }
            _ => "Invalid token".to_string(),
        }
    })?;

    let claims = data.claims;

    // Tenant scope travels in app_metadata so hospital admins cannot
    // self-assign a different hospital through user_metadata
    let hospital_id = claims
        .app_metadata
        .as_ref()
        .and_then(|meta| meta.get("hospital_id"))
        .and_then(|v| v.as_str())
        .and_then(|raw| Uuid::parse_str(raw).ok());

    let created_at = claims
        .iat
        .and_then(|timestamp| Utc.timestamp_opt(timestamp as i64, 0).single());

    let user = User {
        id: claims.sub,
        email: claims.email,
        role: claims.role,
        hospital_id,
        metadata: claims.user_metadata,
        created_at,
    };

    debug!("Token validated successfully for user: {}", user.id);
    Ok(user)
}
