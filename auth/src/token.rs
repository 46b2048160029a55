//! JWT minting and validation.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type TokenResult<T> = Result<T, TokenError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token expired")]
    Expired,

    /// Covers bad signatures, wrong signing algorithm, malformed tokens and
    /// every other reason a token cannot be trusted. Deliberately opaque.
    #[error("invalid token")]
    Invalid,
}

/// Claim set carried by a node token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub slave_id: i64,
    pub slave_name: String,
    pub iss: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
}

/// Issues and validates node-identity tokens with a process-wide secret.
pub struct TokenAuthority {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    lifetime: Duration,
}

impl TokenAuthority {
    pub fn new(secret: &str, issuer: impl Into<String>, lifetime: Duration) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            issuer: issuer.into(),
            lifetime,
        }
    }

    /// Mint a token for a node. The claim set is fixed: identity plus the
    /// standard issuer/issued-at/not-before/expiry fields.
    pub fn generate(&self, slave_id: i64, slave_name: &str) -> TokenResult<String> {
        let now = unix_now();
        let claims = Claims {
            slave_id,
            slave_name: slave_name.to_string(),
            iss: self.issuer.clone(),
            iat: now,
            nbf: now,
            exp: now + self.lifetime.as_secs() as i64,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|_| TokenError::Invalid)
    }

    /// Validate a token and return its claims.
    ///
    /// Only HS256 is accepted; a token signed with any other algorithm is
    /// [`TokenError::Invalid`], an out-of-date one [`TokenError::Expired`].
    pub fn validate(&self, token: &str) -> TokenResult<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_issuer(&[&self.issuer]);

        match decode::<Claims>(token, &self.decoding_key, &validation) {
            Ok(data) => Ok(data.claims),
            Err(err) => match err.kind() {
                ErrorKind::ExpiredSignature => Err(TokenError::Expired),
                _ => Err(TokenError::Invalid),
            },
        }
    }

    /// Re-issue a token. Accepts a token that is valid or expired, but not
    /// one that fails validation for any other reason.
    pub fn refresh(&self, token: &str) -> TokenResult<String> {
        let claims = match self.validate(token) {
            Ok(claims) => claims,
            Err(TokenError::Expired) => self.decode_unverified_expiry(token)?,
            Err(err) => return Err(err),
        };
        self.generate(claims.slave_id, &claims.slave_name)
    }

    /// Decode a token whose signature checks out but whose `exp` is in the
    /// past, so refresh can recover the identity claims.
    fn decode_unverified_expiry(&self, token: &str) -> TokenResult<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_exp = false;
        validation.set_issuer(&[&self.issuer]);

        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|_| TokenError::Invalid)
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authority() -> TokenAuthority {
        TokenAuthority::new("test-secret", "xfleet-master", Duration::from_secs(3600))
    }

    #[test]
    fn test_generate_validate_roundtrip() {
        let auth = authority();
        let token = auth.generate(42, "node-a").unwrap();
        let claims = auth.validate(&token).unwrap();
        assert_eq!(claims.slave_id, 42);
        assert_eq!(claims.slave_name, "node-a");
        assert_eq!(claims.iss, "xfleet-master");
        assert_eq!(claims.exp, claims.iat + 3600);
    }

    #[test]
    fn test_expired_token_is_expired() {
        let auth = TokenAuthority::new("test-secret", "xfleet-master", Duration::from_secs(0));
        // lifetime 0 => exp == iat, which is already in the past with no leeway
        let token = auth.generate(1, "node-a").unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        assert_eq!(auth.validate(&token), Err(TokenError::Expired));
    }

    #[test]
    fn test_wrong_secret_is_invalid() {
        let auth = authority();
        let other = TokenAuthority::new("other-secret", "xfleet-master", Duration::from_secs(3600));
        let token = other.generate(1, "node-a").unwrap();
        assert_eq!(auth.validate(&token), Err(TokenError::Invalid));
    }

    #[test]
    fn test_wrong_algorithm_is_invalid() {
        let auth = authority();
        let now = unix_now();
        let claims = Claims {
            slave_id: 1,
            slave_name: "node-a".to_string(),
            iss: "xfleet-master".to_string(),
            iat: now,
            nbf: now,
            exp: now + 3600,
        };
        let forged = encode(
            &Header::new(Algorithm::HS384),
            &claims,
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap();
        assert_eq!(auth.validate(&forged), Err(TokenError::Invalid));
    }

    #[test]
    fn test_garbage_is_invalid() {
        let auth = authority();
        assert_eq!(auth.validate("not-a-token"), Err(TokenError::Invalid));
    }

    #[test]
    fn test_refresh_expired_token() {
        let short = TokenAuthority::new("test-secret", "xfleet-master", Duration::from_secs(0));
        let token = short.generate(7, "node-b").unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        assert_eq!(short.validate(&token), Err(TokenError::Expired));

        let fresh = authority().refresh(&token).unwrap();
        let claims = authority().validate(&fresh).unwrap();
        assert_eq!(claims.slave_id, 7);
        assert_eq!(claims.slave_name, "node-b");
    }

    #[test]
    fn test_refresh_rejects_forged_token() {
        let other = TokenAuthority::new("other-secret", "xfleet-master", Duration::from_secs(3600));
        let token = other.generate(1, "node-a").unwrap();
        assert_eq!(authority().refresh(&token), Err(TokenError::Invalid));
    }
}
