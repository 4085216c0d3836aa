use huddle_proto::UserProfile;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::error::AuthError;

/// Verifies the identity a connection presents before it may join a room.
pub trait Authenticator: Send + Sync {
    fn verify(&self, token: &str) -> Result<UserProfile, AuthError>;

    /// When true the server accepts the profile carried in `join` as-is.
    fn trusts_client_profile(&self) -> bool {
        false
    }
}

#[derive(Debug, Deserialize)]
struct AccessTokenClaims {
    sub: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default, rename = "avatarUrl")]
    avatar_url: Option<String>,
}

/// HS256 access tokens issued by the account service.
pub struct JwtAuthenticator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }
}

impl Authenticator for JwtAuthenticator {
    fn verify(&self, token: &str) -> Result<UserProfile, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::EmptyToken);
        }
        let data = decode::<AccessTokenClaims>(token, &self.key, &self.validation)?;
        let claims = data.claims;
        if claims.sub.trim().is_empty() {
            return Err(AuthError::MissingSubject);
        }
        let username = claims.username.unwrap_or_else(|| claims.sub.clone());
        Ok(UserProfile {
            id: claims.sub,
            username,
            avatar_url: claims.avatar_url,
        })
    }
}

/// Development mode: the token is taken as the user id and `join` may carry
/// the full profile.
#[derive(Debug, Default, Clone, Copy)]
pub struct BypassAuthenticator;

impl Authenticator for BypassAuthenticator {
    fn verify(&self, token: &str) -> Result<UserProfile, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::EmptyToken);
        }
        Ok(UserProfile::new(token, token))
    }

    fn trusts_client_profile(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;
    use std::time::{SystemTime, UNIX_EPOCH};

    const SECRET: &[u8] = b"test-secret";

    fn token(claims: serde_json::Value) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET),
        )
        .expect("encode token")
    }

    fn future_exp() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_secs()
            + 3600
    }

    #[test_timeout::timeout]
    fn valid_token_yields_profile() {
        let auth = JwtAuthenticator::new(SECRET);
        let jwt = token(json!({
            "sub": "42",
            "username": "ada",
            "avatarUrl": "https://cdn/ada.png",
            "exp": future_exp(),
        }));
        let user = auth.verify(&jwt).expect("verify");
        assert_eq!(user.id, "42");
        assert_eq!(user.username, "ada");
        assert_eq!(user.avatar_url.as_deref(), Some("https://cdn/ada.png"));
    }

    #[test_timeout::timeout]
    fn wrong_secret_is_rejected() {
        let auth = JwtAuthenticator::new(b"other-secret");
        let jwt = token(json!({"sub": "42", "exp": future_exp()}));
        assert!(matches!(auth.verify(&jwt), Err(AuthError::InvalidToken(_))));
    }

    #[test_timeout::timeout]
    fn expired_token_is_rejected() {
        let auth = JwtAuthenticator::new(SECRET);
        let jwt = token(json!({"sub": "42", "exp": 1_000}));
        assert!(auth.verify(&jwt).is_err());
    }

    #[test_timeout::timeout]
    fn bypass_uses_token_as_identity() {
        let user = BypassAuthenticator.verify(" bob ").expect("verify");
        assert_eq!(user.id, "bob");
        assert!(BypassAuthenticator.trusts_client_profile());
        assert!(matches!(
            BypassAuthenticator.verify(""),
            Err(AuthError::EmptyToken)
        ));
    }
}
