//! # enclave-tokens: capability tokens handed to the sandboxed runtime
//!
//! Two HS256 token kinds are minted by the orchestrator: one authorizing tool
//! execution, one authorizing LLM access. They live in disjoint namespaces
//! (distinct issuer, audience and subject) so a token leaked for one purpose is
//! rejected by the verifier of the other.
//!
//! The runtime never decodes tokens. Only the orchestrator, the tool server
//! and the LLM gateway hold the signing secret.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use enclave_protocol::{LlmAccessClaims, RegisteredClaims, ToolExecutionClaims};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Environment variable holding the shared signing secret.
pub const SIGNING_KEY_ENV: &str = "ENCLAVE_SIGNING_KEY";

/// Shortest secret accepted for HS256.
pub const MIN_SECRET_LEN: usize = 32;

const REQUIRED_CLAIMS: [&str; 5] = ["iss", "aud", "sub", "exp", "iat"];

/// Issuer/audience/subject triple identifying one token purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenNamespace {
    pub issuer: &'static str,
    pub audience: &'static str,
    pub subject: &'static str,
}

pub const TOOL_EXECUTION: TokenNamespace = TokenNamespace {
    issuer: "enclave-tool-issuer",
    audience: "enclave-tool-server",
    subject: "enclave-tool-execution",
};

pub const LLM_ACCESS: TokenNamespace = TokenNamespace {
    issuer: "enclave-llm-issuer",
    audience: "enclave-llm-gateway",
    subject: "enclave-llm-access",
};

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("signing secret too short: {len} bytes, need at least {min}")]
    WeakSecret { len: usize, min: usize },
    #[error("signing secret missing: set {0}")]
    MissingSecret(&'static str),
    #[error("token ttl must be at least one second")]
    ZeroTtl,
    #[error("token expired")]
    Expired,
    #[error("token belongs to a different namespace: {0}")]
    WrongNamespace(&'static str),
    #[error("token algorithm not allowed")]
    InvalidAlgorithm,
    #[error("token signature invalid")]
    InvalidSignature,
    #[error("token missing required claim: {0}")]
    MissingClaim(String),
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("token encoding failed: {0}")]
    Encode(String),
}

pub type TokenResult<T> = Result<T, TokenError>;

impl From<jsonwebtoken::errors::Error> for TokenError {
    fn from(error: jsonwebtoken::errors::Error) -> Self {
        match error.kind() {
            ErrorKind::ExpiredSignature => Self::Expired,
            ErrorKind::InvalidIssuer => Self::WrongNamespace("issuer"),
            ErrorKind::InvalidAudience => Self::WrongNamespace("audience"),
            ErrorKind::InvalidSubject => Self::WrongNamespace("subject"),
            ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName | ErrorKind::MissingAlgorithm => {
                Self::InvalidAlgorithm
            }
            ErrorKind::InvalidSignature => Self::InvalidSignature,
            ErrorKind::MissingRequiredClaim(claim) => Self::MissingClaim(claim.clone()),
            _ => Self::Malformed(error.to_string()),
        }
    }
}

/// Registered claims plus the purpose-specific payload, as carried on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireClaims<C> {
    #[serde(flatten)]
    registered: RegisteredClaims,
    #[serde(flatten)]
    claims: C,
}

/// A token that passed verification.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedToken<C> {
    pub registered: RegisteredClaims,
    pub claims: C,
}

/// Mints and verifies both token kinds with one shared secret.
pub struct TokenAuthority {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl std::fmt::Debug for TokenAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenAuthority").finish_non_exhaustive()
    }
}

impl TokenAuthority {
    pub fn from_secret(secret: &[u8]) -> TokenResult<Self> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(TokenError::WeakSecret {
                len: secret.len(),
                min: MIN_SECRET_LEN,
            });
        }
        Ok(Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        })
    }

    /// Load the secret from [`SIGNING_KEY_ENV`].
    pub fn from_env() -> TokenResult<Self> {
        let secret = std::env::var(SIGNING_KEY_ENV).map_err(|_| TokenError::MissingSecret(SIGNING_KEY_ENV))?;
        Self::from_secret(secret.as_bytes())
    }

    pub fn mint_tool_token(&self, claims: &ToolExecutionClaims, ttl: Duration) -> TokenResult<String> {
        self.mint(TOOL_EXECUTION, claims, ttl)
    }

    pub fn verify_tool_token(&self, token: &str) -> TokenResult<VerifiedToken<ToolExecutionClaims>> {
        self.verify(TOOL_EXECUTION, token)
    }

    pub fn mint_llm_token(&self, claims: &LlmAccessClaims, ttl: Duration) -> TokenResult<String> {
        self.mint(LLM_ACCESS, claims, ttl)
    }

    pub fn verify_llm_token(&self, token: &str) -> TokenResult<VerifiedToken<LlmAccessClaims>> {
        self.verify(LLM_ACCESS, token)
    }

    pub fn mint<C>(&self, namespace: TokenNamespace, claims: &C, ttl: Duration) -> TokenResult<String>
    where
        C: Serialize + Clone,
    {
        self.mint_at(namespace, claims, unix_now(), ttl)
    }

    fn mint_at<C>(
        &self,
        namespace: TokenNamespace,
        claims: &C,
        issued_at: u64,
        ttl: Duration,
    ) -> TokenResult<String>
    where
        C: Serialize + Clone,
    {
        if ttl.as_secs() == 0 {
            return Err(TokenError::ZeroTtl);
        }
        let registered = RegisteredClaims {
            iss: namespace.issuer.to_owned(),
            aud: namespace.audience.to_owned(),
            sub: namespace.subject.to_owned(),
            iat: issued_at,
            exp: issued_at.saturating_add(ttl.as_secs()),
            jti: uuid::Uuid::new_v4().to_string(),
        };
        debug!(audience = namespace.audience, jti = %registered.jti, exp = registered.exp, "minting capability token");
        let wire = WireClaims {
            registered,
            claims: claims.clone(),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &wire, &self.encoding)
            .map_err(|error| TokenError::Encode(error.to_string()))
    }

    pub fn verify<C>(&self, namespace: TokenNamespace, token: &str) -> TokenResult<VerifiedToken<C>>
    where
        C: DeserializeOwned,
    {
        let data = jsonwebtoken::decode::<WireClaims<C>>(token, &self.decoding, &validation(namespace))?;
        Ok(VerifiedToken {
            registered: data.claims.registered,
            claims: data.claims.claims,
        })
    }
}

fn validation(namespace: TokenNamespace) -> Validation {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;
    validation.validate_exp = true;
    validation.set_issuer(&[namespace.issuer]);
    validation.set_audience(&[namespace.audience]);
    validation.sub = Some(namespace.subject.to_owned());
    validation.set_required_spec_claims(&REQUIRED_CLAIMS);
    validation
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use enclave_protocol::{OrganizationId, SessionId, WorkspaceId};
    use serde_json::json;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    fn tool_claims() -> ToolExecutionClaims {
        ToolExecutionClaims {
            workspace_id: WorkspaceId::from("ws-1"),
            organization_id: OrganizationId::from("org-1"),
            user_id: None,
            session_id: SessionId::from("sess-1"),
            allowed_actions: ["core.http_request".to_owned()].into_iter().collect(),
            allowed_internal_tools: Default::default(),
            user_mcp_servers: Vec::new(),
            internal_tool_context: json!({"case_id": "c-1"}),
        }
    }

    fn llm_claims() -> LlmAccessClaims {
        LlmAccessClaims {
            workspace_id: WorkspaceId::from("ws-1"),
            organization_id: OrganizationId::from("org-1"),
            session_id: SessionId::from("sess-1"),
            model: "model-a".to_owned(),
            provider: "provider-a".to_owned(),
            model_settings: json!({}),
            output_type: None,
            credential_scope: "workspace".to_owned(),
        }
    }

    #[test]
    fn tool_token_roundtrips_claims() {
        let authority = TokenAuthority::from_secret(SECRET).unwrap();
        let token = authority
            .mint_tool_token(&tool_claims(), Duration::from_secs(60))
            .unwrap();
        let verified = authority.verify_tool_token(&token).unwrap();
        assert_eq!(verified.claims, tool_claims());
        assert_eq!(verified.registered.aud, TOOL_EXECUTION.audience);
        assert_eq!(verified.registered.exp, verified.registered.iat + 60);
    }

    #[test]
    fn tokens_are_rejected_across_namespaces() {
        let authority = TokenAuthority::from_secret(SECRET).unwrap();
        let tool = authority
            .mint_tool_token(&tool_claims(), Duration::from_secs(60))
            .unwrap();
        let llm = authority
            .mint_llm_token(&llm_claims(), Duration::from_secs(60))
            .unwrap();

        assert!(matches!(
            authority.verify_llm_token(&tool),
            Err(TokenError::WrongNamespace(_))
        ));
        assert!(matches!(
            authority.verify_tool_token(&llm),
            Err(TokenError::WrongNamespace(_))
        ));
        assert!(authority.verify_llm_token(&llm).is_ok());

        // Audience and subject forged for the tool server, issuer from the
        // LLM namespace.
        let forged = TokenNamespace {
            issuer: LLM_ACCESS.issuer,
            ..TOOL_EXECUTION
        };
        let token = authority
            .mint_at(forged, &tool_claims(), unix_now(), Duration::from_secs(60))
            .unwrap();
        assert!(matches!(
            authority.verify_tool_token(&token),
            Err(TokenError::WrongNamespace("issuer"))
        ));
    }

    #[test]
    fn namespaces_share_no_identifier() {
        assert_ne!(TOOL_EXECUTION.issuer, LLM_ACCESS.issuer);
        assert_ne!(TOOL_EXECUTION.audience, LLM_ACCESS.audience);
        assert_ne!(TOOL_EXECUTION.subject, LLM_ACCESS.subject);
    }

    #[test]
    fn expired_token_fails_despite_valid_signature() {
        let authority = TokenAuthority::from_secret(SECRET).unwrap();
        let issued_at = unix_now() - 120;
        let token = authority
            .mint_at(TOOL_EXECUTION, &tool_claims(), issued_at, Duration::from_secs(60))
            .unwrap();
        assert!(matches!(
            authority.verify_tool_token(&token),
            Err(TokenError::Expired)
        ));
    }

    #[test]
    fn foreign_secret_and_algorithm_are_rejected() {
        let authority = TokenAuthority::from_secret(SECRET).unwrap();
        let other = TokenAuthority::from_secret(b"ffffffffffffffffffffffffffffffff").unwrap();
        let token = other
            .mint_tool_token(&tool_claims(), Duration::from_secs(60))
            .unwrap();
        assert!(matches!(
            authority.verify_tool_token(&token),
            Err(TokenError::InvalidSignature)
        ));

        let now = unix_now();
        let wire = WireClaims {
            registered: RegisteredClaims {
                iss: TOOL_EXECUTION.issuer.to_owned(),
                aud: TOOL_EXECUTION.audience.to_owned(),
                sub: TOOL_EXECUTION.subject.to_owned(),
                iat: now,
                exp: now + 60,
                jti: "j".to_owned(),
            },
            claims: tool_claims(),
        };
        let hs384 = jsonwebtoken::encode(
            &Header::new(Algorithm::HS384),
            &wire,
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap();
        assert!(matches!(
            authority.verify_tool_token(&hs384),
            Err(TokenError::InvalidAlgorithm)
        ));
    }

    #[test]
    fn missing_required_claims_are_rejected() {
        #[derive(Serialize)]
        struct Partial {
            iss: &'static str,
            aud: &'static str,
            #[serde(skip_serializing_if = "Option::is_none")]
            sub: Option<&'static str>,
            exp: u64,
            #[serde(skip_serializing_if = "Option::is_none")]
            iat: Option<u64>,
        }
        let authority = TokenAuthority::from_secret(SECRET).unwrap();
        let now = unix_now();
        let sign = |claims: &Partial| {
            jsonwebtoken::encode(
                &Header::new(Algorithm::HS256),
                claims,
                &EncodingKey::from_secret(SECRET),
            )
            .unwrap()
        };

        let no_subject = sign(&Partial {
            iss: TOOL_EXECUTION.issuer,
            aud: TOOL_EXECUTION.audience,
            sub: None,
            exp: now + 60,
            iat: Some(now),
        });
        let err = authority.verify_tool_token(&no_subject).unwrap_err();
        assert!(matches!(err, TokenError::MissingClaim(claim) if claim == "sub"));

        let no_issued_at = sign(&Partial {
            iss: TOOL_EXECUTION.issuer,
            aud: TOOL_EXECUTION.audience,
            sub: Some(TOOL_EXECUTION.subject),
            exp: now + 60,
            iat: None,
        });
        assert!(authority.verify_tool_token(&no_issued_at).is_err());
    }

    #[test]
    fn weak_secret_and_zero_ttl_are_validation_errors() {
        assert!(matches!(
            TokenAuthority::from_secret(b"short"),
            Err(TokenError::WeakSecret { len: 5, .. })
        ));
        let authority = TokenAuthority::from_secret(SECRET).unwrap();
        assert!(matches!(
            authority.mint_tool_token(&tool_claims(), Duration::from_millis(500)),
            Err(TokenError::ZeroTtl)
        ));
    }
}
