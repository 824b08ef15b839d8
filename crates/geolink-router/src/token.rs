//! Location token sealing and opening
//!
//! Tokens are the JSON-serialized payload sealed with AES-256-GCM under a
//! per-deployment key. The freshly generated 12-byte IV is bound into the
//! cipher initialization, the 16-byte tag is produced separately, and the
//! wire form is `base64url(hex(iv) + ":" + hex(tag) + ":" + hex(ct))` so the
//! token survives URL embedding unescaped.
//!
//! Opening fails closed: malformed base64, bad hex, wrong segment count,
//! wrong IV/tag lengths, tag mismatch, or unparsable plaintext all map to
//! the same opaque error. No partial payload is ever returned.

use crate::{RouterError, RouterResult};
use geolink_common::{GeoPoint, Region};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

/// Environment variable holding the hex-encoded 32-byte token key
pub const TOKEN_KEY_ENV: &str = "GEOLINK_TOKEN_KEY";

/// Payload schema version
pub const PAYLOAD_VERSION: u8 = 2;

const TAG_LEN: usize = 16;

/// Geographic point as embedded in the token wire format
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenGeo {
    /// Latitude in degrees
    pub lat: f64,
    /// Longitude in degrees
    pub lng: f64,
    /// Accuracy of the fix in meters, if reported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
}

impl From<GeoPoint> for TokenGeo {
    fn from(p: GeoPoint) -> Self {
        Self {
            lat: p.lat,
            lng: p.lng,
            accuracy: p.accuracy_m,
        }
    }
}

impl From<TokenGeo> for GeoPoint {
    fn from(g: TokenGeo) -> Self {
        Self {
            lat: g.lat,
            lng: g.lng,
            accuracy_m: g.accuracy,
        }
    }
}

/// Endpoint addresses copied from the chosen region at generation time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEndpoints {
    /// API endpoint address
    pub api: String,
    /// Voice/streaming endpoint address
    pub ws: String,
}

/// Region/datacenter metadata for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMeta {
    /// Region display name
    pub region: String,
    /// Datacenter identifier
    pub dc: String,
}

/// The location token payload
///
/// Field names are the wire contract; do not rename.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenPayload {
    /// Schema version
    pub v: u8,
    /// Business identifier
    pub b: String,
    /// Location identifier
    pub l: String,
    /// Chosen region id
    pub r: String,
    /// Creation time, epoch milliseconds
    pub t: i64,
    /// Geographic point the code was generated for
    pub geo: TokenGeo,
    /// Chosen region's routing endpoints
    pub endpoints: TokenEndpoints,
    /// Diagnostic metadata
    pub meta: TokenMeta,
}

impl TokenPayload {
    /// Build a v2 payload for a business location resolved to a region
    pub fn new(
        business_id: &str,
        location_id: &str,
        region: &Region,
        point: GeoPoint,
        api_endpoint: &str,
        ws_endpoint: &str,
        created_at_ms: i64,
    ) -> Self {
        Self {
            v: PAYLOAD_VERSION,
            b: business_id.to_string(),
            l: location_id.to_string(),
            r: region.id.clone(),
            t: created_at_ms,
            geo: point.into(),
            endpoints: TokenEndpoints {
                api: api_endpoint.to_string(),
                ws: ws_endpoint.to_string(),
            },
            meta: TokenMeta {
                region: region.name.clone(),
                dc: region.datacenter.clone(),
            },
        }
    }
}

/// Seals and opens location tokens under a single AES-256-GCM key
pub struct TokenSealer {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl TokenSealer {
    /// Create a sealer from 32 raw key bytes
    pub fn new(key_bytes: &[u8]) -> RouterResult<Self> {
        let unbound = UnboundKey::new(&AES_256_GCM, key_bytes)
            .map_err(|_| RouterError::MissingKey("key must be 32 bytes".to_string()))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// Create a sealer from the `GEOLINK_TOKEN_KEY` environment variable
    ///
    /// The variable must hold 64 hex characters. Absence or malformed key
    /// material is a fatal startup condition, never retried.
    pub fn from_env() -> RouterResult<Self> {
        let raw = std::env::var(TOKEN_KEY_ENV)
            .map_err(|_| RouterError::MissingKey(format!("{TOKEN_KEY_ENV} is not set")))?;
        let bytes = hex::decode(raw.trim())
            .map_err(|_| RouterError::MissingKey(format!("{TOKEN_KEY_ENV} is not valid hex")))?;
        Self::new(&bytes)
    }

    /// Seal a payload into an opaque URL-safe token
    pub fn seal(&self, payload: &TokenPayload) -> RouterResult<String> {
        let mut iv = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut iv)
            .map_err(|_| RouterError::Crypto("IV generation failed".to_string()))?;

        let mut in_out = serde_json::to_vec(payload)
            .map_err(|e| RouterError::Crypto(format!("payload serialization failed: {e}")))?;

        let nonce = Nonce::assume_unique_for_key(iv);
        let tag = self
            .key
            .seal_in_place_separate_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| RouterError::Crypto("seal failed".to_string()))?;

        let joined = format!(
            "{}:{}:{}",
            hex::encode(iv),
            hex::encode(tag.as_ref()),
            hex::encode(&in_out)
        );
        Ok(URL_SAFE_NO_PAD.encode(joined.as_bytes()))
    }

    /// Open a presented token, failing closed on any corruption
    pub fn open(&self, token: &str) -> RouterResult<TokenPayload> {
        let decoded = URL_SAFE_NO_PAD
            .decode(token.as_bytes())
            .map_err(|_| RouterError::InvalidToken)?;
        let joined = String::from_utf8(decoded).map_err(|_| RouterError::InvalidToken)?;

        let mut parts = joined.split(':');
        let (iv_hex, tag_hex, ct_hex) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(iv), Some(tag), Some(ct), None) => (iv, tag, ct),
            _ => return Err(RouterError::InvalidToken),
        };

        let iv = hex::decode(iv_hex).map_err(|_| RouterError::InvalidToken)?;
        let tag = hex::decode(tag_hex).map_err(|_| RouterError::InvalidToken)?;
        let ciphertext = hex::decode(ct_hex).map_err(|_| RouterError::InvalidToken)?;

        if iv.len() != NONCE_LEN || tag.len() != TAG_LEN {
            return Err(RouterError::InvalidToken);
        }

        let mut iv_bytes = [0u8; NONCE_LEN];
        iv_bytes.copy_from_slice(&iv);
        let nonce = Nonce::assume_unique_for_key(iv_bytes);

        let mut in_out = ciphertext;
        in_out.extend_from_slice(&tag);

        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| RouterError::InvalidToken)?;

        serde_json::from_slice(plaintext).map_err(|_| RouterError::InvalidToken)
    }
}
