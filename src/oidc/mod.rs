//! OIDC discovery/JWKS/PKCE helper (spec §1: "the gateway only consumes ...
//! an OIDC discovery document with JWKS"; §6 `/oauth2/authorization/<provider>`,
//! `/login/oauth2/code/<provider>`). The gateway never issues its own tokens
//! (non-goal, spec §1) — this module only drives the authorization-code +
//! PKCE dance against an external identity provider and verifies the
//! resulting `id_token`'s signature against the provider's JWKS.
//!
//! Grounded in the teacher's DID-document cache-aside pattern (`auth.rs`'s
//! `moka::future::Cache` fronting a remote fetch) for the discovery-document
//! and JWKS caches, and in `jsonwebtoken`'s `DecodingKey::from_rsa_components`
//! the way `auth.rs` builds decoding keys from resolved key material.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use moka::future::Cache;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::config::OidcSection;
use crate::error::GatewayError;

#[derive(Debug, Clone, Deserialize)]
struct DiscoveryDocument {
    issuer: String,
    authorization_endpoint: String,
    token_endpoint: String,
    jwks_uri: String,
}

#[derive(Debug, Clone, Deserialize)]
struct Jwks {
    keys: Vec<JwkKey>,
}

#[derive(Debug, Clone, Deserialize)]
struct JwkKey {
    kid: String,
    n: String,
    e: String,
    #[serde(default = "default_alg")]
    alg: String,
}

fn default_alg() -> String {
    "RS256".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: u64,
    #[serde(default)]
    pub id_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PkceChallenge {
    pub verifier: String,
    pub challenge: String,
}

/// Generates a code_verifier/code_challenge pair per RFC 7636 (S256).
pub fn generate_pkce() -> PkceChallenge {
    let mut raw = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut raw);
    let verifier = URL_SAFE_NO_PAD.encode(raw);
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    let challenge = URL_SAFE_NO_PAD.encode(hasher.finalize());
    PkceChallenge { verifier, challenge }
}

pub fn generate_state() -> String {
    let mut raw = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut raw);
    URL_SAFE_NO_PAD.encode(raw)
}

const DISCOVERY_TTL: Duration = Duration::from_secs(3600);

pub struct OidcClient {
    config: OidcSection,
    http: reqwest::Client,
    discovery: RwLock<Option<DiscoveryDocument>>,
    jwks: Cache<String, Arc<DecodingKey>>,
}

impl OidcClient {
    pub fn new(config: OidcSection) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            discovery: RwLock::new(None),
            jwks: Cache::builder().time_to_live(DISCOVERY_TTL).max_capacity(32).build(),
        }
    }

    async fn discovery_document(&self) -> Result<DiscoveryDocument, GatewayError> {
        if let Some(doc) = self.discovery.read().await.clone() {
            return Ok(doc);
        }
        let url = format!("{}/.well-known/openid-configuration", self.config.issuer.trim_end_matches('/'));
        let doc: DiscoveryDocument = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|_| GatewayError::IdentityUnavailable)?
            .json()
            .await
            .map_err(|e| GatewayError::Internal(format!("oidc discovery decode: {e}")))?;
        *self.discovery.write().await = Some(doc.clone());
        Ok(doc)
    }

    pub async fn authorization_url(
        &self,
        provider_redirect_uri: &str,
        state: &str,
        pkce: &PkceChallenge,
    ) -> Result<String, GatewayError> {
        let doc = self.discovery_document().await?;
        let mut url = url::Url::parse(&doc.authorization_endpoint)
            .map_err(|e| GatewayError::ConfigInvalid(format!("oidc.issuer: {e}")))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", provider_redirect_uri)
            .append_pair("scope", "openid profile email offline_access")
            .append_pair("state", state)
            .append_pair("code_challenge", &pkce.challenge)
            .append_pair("code_challenge_method", "S256");
        Ok(url.to_string())
    }

    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        code_verifier: &str,
    ) -> Result<TokenResponse, GatewayError> {
        let doc = self.discovery_document().await?;
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("code_verifier", code_verifier),
        ];
        self.post_token(&doc.token_endpoint, &params).await
    }

    pub async fn refresh_token(&self, refresh_token: &str) -> Result<TokenResponse, GatewayError> {
        let doc = self.discovery_document().await?;
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ];
        self.post_token(&doc.token_endpoint, &params).await
    }

    async fn post_token(&self, endpoint: &str, params: &[(&str, &str)]) -> Result<TokenResponse, GatewayError> {
        let response = self
            .http
            .post(endpoint)
            .form(params)
            .send()
            .await
            .map_err(|_| GatewayError::IdentityUnavailable)?;
        if !response.status().is_success() {
            return Err(GatewayError::Unauthorized("token exchange rejected".into()));
        }
        response
            .json()
            .await
            .map_err(|e| GatewayError::Internal(format!("token response decode: {e}")))
    }

    /// Verifies an `id_token`'s signature against the provider's JWKS and
    /// returns its subject claim. The gateway never mints tokens of its own
    /// (non-goal, spec §1) — this is read-only verification of what the IdP
    /// issued.
    pub async fn verify_id_token_subject(&self, id_token: &str) -> Result<String, GatewayError> {
        let header = jsonwebtoken::decode_header(id_token)
            .map_err(|e| GatewayError::Unauthorized(format!("invalid id_token header: {e}")))?;
        let kid = header
            .kid
            .ok_or_else(|| GatewayError::Unauthorized("id_token missing kid".into()))?;
        let key = self.decoding_key_for(&kid).await?;
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[self.config.client_id.clone()]);
        let claims = decode::<serde_json::Value>(id_token, &key, &validation)
            .map_err(|e| GatewayError::Unauthorized(format!("id_token verification failed: {e}")))?;
        claims
            .claims
            .get("sub")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| GatewayError::Unauthorized("id_token missing sub".into()))
    }

    async fn decoding_key_for(&self, kid: &str) -> Result<Arc<DecodingKey>, GatewayError> {
        if let Some(key) = self.jwks.get(kid).await {
            return Ok(key);
        }
        let doc = self.discovery_document().await?;
        let jwks: Jwks = self
            .http
            .get(&doc.jwks_uri)
            .send()
            .await
            .map_err(|_| GatewayError::IdentityUnavailable)?
            .json()
            .await
            .map_err(|e| GatewayError::Internal(format!("jwks decode: {e}")))?;
        for key in &jwks.keys {
            let decoding_key = DecodingKey::from_rsa_components(&key.n, &key.e)
                .map_err(|e| GatewayError::Internal(format!("jwks key material: {e}")))?;
            self.jwks.insert(key.kid.clone(), Arc::new(decoding_key)).await;
        }
        self.jwks
            .get(kid)
            .await
            .ok_or_else(|| GatewayError::Unauthorized(format!("unknown jwks kid {kid}")))
    }
}
