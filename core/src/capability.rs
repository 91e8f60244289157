//! Capability tokens: short-lived signed bindings of one run step to one
//! page identity, mode, and tool set.
//!
//! Tokens exist only in memory and on the wire to the bridge; they are never
//! persisted, and a process restart therefore revokes everything implicitly.
//! The keyring is one of the two process-wide singletons (the clock is the
//! other) and is wiped synchronously on panic before any new token can be
//! minted.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::Hmac;
use hmac::Mac;
use rand::RngCore;
use serde::Deserialize;
use serde::Serialize;
use sha2::Sha256;
use strum_macros::Display;
use uuid::Uuid;

use webpilot_protocol::PageBinding;

use crate::canonical;
use crate::canonical::Hash;
use crate::clock::Clock;
use crate::error::CoreErr;
use crate::error::Result;

type HmacSha256 = Hmac<Sha256>;

/// Retired keys kept alive so in-flight verifications can complete across a
/// rotation.
const RETIRED_KEYS: usize = 2;

/// Bound on the per-token revocation set; rotation clears it wholesale long
/// before it fills in practice.
const MAX_REVOKED: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum RotationReason {
    DocumentChange,
    NavGenChange,
    ModeChange,
    TtlExpiry,
    Panic,
    Lock,
}

/// The signed record. Serialized canonically before MACing so equal payloads
/// always produce equal tags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokenPayload {
    pub run_id: Uuid,
    pub profile_id: String,
    pub binding: PageBinding,
    pub allowed_tools: Vec<String>,
    pub issued_at_ms: u64,
    pub expires_at_ms: u64,
    pub key_id: String,
}

#[derive(Debug, Clone)]
pub struct CapabilityToken {
    pub payload: TokenPayload,
    /// `base64url(canonical payload) . base64url(mac)`.
    pub wire: String,
}

struct SigningKey {
    id: String,
    secret: [u8; 32],
}

impl SigningKey {
    fn generate() -> Self {
        let mut secret = [0u8; 32];
        rand::rng().fill_bytes(&mut secret);
        let mut id_bytes = [0u8; 4];
        rand::rng().fill_bytes(&mut id_bytes);
        let id = id_bytes.iter().map(|b| format!("{b:02x}")).collect();
        Self { id, secret }
    }

    fn mac(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| CoreErr::Internal(format!("hmac key: {e}")))?;
        mac.update(bytes);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    fn verify(&self, bytes: &[u8], tag: &[u8]) -> Result<()> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| CoreErr::Internal(format!("hmac key: {e}")))?;
        mac.update(bytes);
        mac.verify_slice(tag).map_err(|_| CoreErr::Tampered)
    }
}

#[derive(Default)]
struct Keyring {
    active: Option<SigningKey>,
    retired: VecDeque<SigningKey>,
    revoked_tags: HashSet<Vec<u8>>,
    /// Set by the panic path; minting stays refused until explicit
    /// re-authorization unlocks the service.
    locked: bool,
}

impl Keyring {
    fn key_by_id(&self, id: &str) -> Option<&SigningKey> {
        if self.active.as_ref().is_some_and(|k| k.id == id) {
            return self.active.as_ref();
        }
        self.retired.iter().find(|k| k.id == id)
    }
}

pub struct TokenService {
    keyring: Mutex<Keyring>,
    clock: Clock,
}

impl TokenService {
    pub fn new(clock: Clock) -> Self {
        Self {
            keyring: Mutex::new(Keyring::default()),
            clock,
        }
    }

    fn lock_keyring(&self) -> std::sync::MutexGuard<'_, Keyring> {
        match self.keyring.lock() {
            Ok(guard) => guard,
            // A poisoned keyring means a panic mid-mutation; treat its
            // contents as gone.
            Err(poisoned) => {
                let mut guard = poisoned.into_inner();
                *guard = Keyring {
                    locked: true,
                    ..Keyring::default()
                };
                guard
            }
        }
    }

    pub fn mint(
        &self,
        run_id: Uuid,
        profile_id: &str,
        binding: &PageBinding,
        allowed_tools: Vec<String>,
        ttl: Duration,
    ) -> Result<CapabilityToken> {
        let now_ms = self.clock.now_ms();
        let mut ring = self.lock_keyring();
        if ring.locked {
            return Err(CoreErr::PermissionRequired(
                "token service is locked pending re-authorization".to_string(),
            ));
        }
        let key = ring.active.get_or_insert_with(SigningKey::generate);

        let payload = TokenPayload {
            run_id,
            profile_id: profile_id.to_string(),
            binding: binding.clone(),
            allowed_tools,
            issued_at_ms: now_ms,
            expires_at_ms: now_ms.saturating_add(ttl.as_millis() as u64),
            key_id: key.id.clone(),
        };
        let bytes = canonical::canonical_json_bytes(&payload)?;
        let tag = key.mac(&bytes)?;
        let wire = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&bytes),
            URL_SAFE_NO_PAD.encode(&tag)
        );
        Ok(CapabilityToken { payload, wire })
    }

    /// Pure in the sense required by the token-idempotence law: the outcome
    /// depends only on (wire, keyring contents, expected binding, tool,
    /// clock reading).
    pub fn verify(
        &self,
        wire: &str,
        expected_binding: &PageBinding,
        tool: &str,
    ) -> Result<TokenPayload> {
        let (payload_b64, tag_b64) = wire.split_once('.').ok_or(CoreErr::Tampered)?;
        let bytes = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| CoreErr::Tampered)?;
        let tag = URL_SAFE_NO_PAD
            .decode(tag_b64)
            .map_err(|_| CoreErr::Tampered)?;
        let payload: TokenPayload =
            serde_json::from_slice(&bytes).map_err(|_| CoreErr::Tampered)?;

        {
            let ring = self.lock_keyring();
            let key = ring.key_by_id(&payload.key_id).ok_or(CoreErr::UnknownKey)?;
            key.verify(&bytes, &tag)?;
            if ring.revoked_tags.contains(&tag) {
                return Err(CoreErr::TokenExpired);
            }
        }

        if self.clock.now_ms() >= payload.expires_at_ms {
            return Err(CoreErr::TokenExpired);
        }
        if &payload.binding != expected_binding {
            return Err(CoreErr::BindingMismatch);
        }
        if !payload.allowed_tools.iter().any(|t| t == tool) {
            return Err(CoreErr::ToolNotPermitted(tool.to_string()));
        }
        Ok(payload)
    }

    /// Revoke a single token immediately.
    pub fn revoke(&self, token: &CapabilityToken) {
        if let Some((_, tag_b64)) = token.wire.split_once('.')
            && let Ok(tag) = URL_SAFE_NO_PAD.decode(tag_b64)
        {
            let mut ring = self.lock_keyring();
            if ring.revoked_tags.len() >= MAX_REVOKED {
                // Oversized revocation set: rotate instead, which revokes
                // everything signed by the retired keys once they age out.
                ring.revoked_tags.clear();
                let old = ring.active.take();
                if let Some(old) = old {
                    ring.retired.push_front(old);
                    ring.retired.truncate(RETIRED_KEYS);
                }
                ring.active = Some(SigningKey::generate());
            }
            ring.revoked_tags.insert(tag);
        }
    }

    /// Replace the active key. Panic and lock wipe the whole ring instead of
    /// retiring, so nothing minted before survives verification.
    pub fn rotate(&self, reason: RotationReason) {
        let mut ring = self.lock_keyring();
        tracing::debug!(reason = %reason, "rotating capability keyring");
        match reason {
            RotationReason::Panic | RotationReason::Lock => {
                *ring = Keyring {
                    locked: true,
                    ..Keyring::default()
                };
            }
            RotationReason::DocumentChange
            | RotationReason::NavGenChange
            | RotationReason::ModeChange
            | RotationReason::TtlExpiry => {
                let old = ring.active.take();
                if let Some(old) = old {
                    ring.retired.push_front(old);
                    ring.retired.truncate(RETIRED_KEYS);
                }
                ring.active = Some(SigningKey::generate());
            }
        }
    }

    /// Revoke every outstanding token without locking the service.
    pub fn revoke_all(&self) {
        let mut ring = self.lock_keyring();
        ring.active = None;
        ring.retired.clear();
        ring.revoked_tags.clear();
    }

    /// Re-authorization path out of the panic lock.
    pub fn unlock(&self) {
        let mut ring = self.lock_keyring();
        ring.locked = false;
    }

    pub fn is_locked(&self) -> bool {
        self.lock_keyring().locked
    }

    /// HMAC the chain head hash with the active key, for tamper-evident
    /// checkpoint export. Returns `(signature_hex, key_id)`.
    pub fn sign_head(&self, head_hash: &Hash) -> Option<(String, String)> {
        let ring = self.lock_keyring();
        let key = ring.active.as_ref()?;
        let tag = key.mac(head_hash).ok()?;
        let tag: Hash = tag.as_slice().try_into().ok()?;
        Some((canonical::to_hex(&tag), key.id.clone()))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use webpilot_protocol::DocumentIdentity;
    use webpilot_protocol::Mode;

    fn binding(nav_gen: u64) -> PageBinding {
        PageBinding {
            origin: "https://example.com".to_string(),
            tab_id: 1,
            frame_id: 0,
            document: DocumentIdentity {
                document_id: "D1".to_string(),
                navigation_generation: nav_gen,
            },
            mode: Mode::Assist,
        }
    }

    fn service() -> (TokenService, Clock) {
        let clock = Clock::fixed(1_000_000);
        (TokenService::new(clock.clone()), clock)
    }

    fn mint(svc: &TokenService, nav_gen: u64) -> CapabilityToken {
        svc.mint(
            Uuid::new_v4(),
            "default",
            &binding(nav_gen),
            vec!["browser.click".to_string()],
            Duration::from_millis(30_000),
        )
        .unwrap()
    }

    #[test]
    fn mint_verify_round_trip() {
        let (svc, _clock) = service();
        let token = mint(&svc, 1);
        let payload = svc.verify(&token.wire, &binding(1), "browser.click").unwrap();
        assert_eq!(payload.binding, binding(1));
    }

    #[test]
    fn nav_generation_change_is_a_binding_mismatch() {
        let (svc, _clock) = service();
        let token = mint(&svc, 1);
        let err = svc.verify(&token.wire, &binding(2), "browser.click").unwrap_err();
        assert!(matches!(err, CoreErr::BindingMismatch));
    }

    #[test]
    fn expiry_honors_the_clock() {
        let (svc, clock) = service();
        let token = mint(&svc, 1);
        clock.advance_ms(30_001);
        let err = svc.verify(&token.wire, &binding(1), "browser.click").unwrap_err();
        assert!(matches!(err, CoreErr::TokenExpired));
    }

    #[test]
    fn tool_outside_the_grant_is_refused() {
        let (svc, _clock) = service();
        let token = mint(&svc, 1);
        let err = svc.verify(&token.wire, &binding(1), "browser.type").unwrap_err();
        assert!(matches!(err, CoreErr::ToolNotPermitted(_)));
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let (svc, _clock) = service();
        let token = mint(&svc, 1);
        let (payload_b64, tag_b64) = token.wire.split_once('.').unwrap();
        let mut bytes = URL_SAFE_NO_PAD.decode(payload_b64).unwrap();
        // Flip one byte of the canonical payload.
        bytes[10] ^= 0x01;
        let forged = format!("{}.{}", URL_SAFE_NO_PAD.encode(&bytes), tag_b64);
        let err = svc.verify(&forged, &binding(1), "browser.click").unwrap_err();
        assert!(matches!(err, CoreErr::Tampered) || matches!(err, CoreErr::UnknownKey));
    }

    #[test]
    fn rotation_keeps_recent_keys_verifiable() {
        let (svc, _clock) = service();
        let token = mint(&svc, 1);
        svc.rotate(RotationReason::TtlExpiry);
        assert!(svc.verify(&token.wire, &binding(1), "browser.click").is_ok());
        svc.rotate(RotationReason::TtlExpiry);
        svc.rotate(RotationReason::TtlExpiry);
        let err = svc.verify(&token.wire, &binding(1), "browser.click").unwrap_err();
        assert!(matches!(err, CoreErr::UnknownKey));
    }

    #[test]
    fn panic_wipes_and_locks() {
        let (svc, _clock) = service();
        let token = mint(&svc, 1);
        svc.rotate(RotationReason::Panic);
        assert!(svc.verify(&token.wire, &binding(1), "browser.click").is_err());
        assert!(svc.is_locked());
        let err = svc
            .mint(
                Uuid::new_v4(),
                "default",
                &binding(1),
                vec!["browser.click".to_string()],
                Duration::from_millis(1_000),
            )
            .unwrap_err();
        assert!(matches!(err, CoreErr::PermissionRequired(_)));
        svc.unlock();
        assert!(!svc.is_locked());
        mint(&svc, 1);
    }

    #[test]
    fn revoked_token_fails_while_twin_still_verifies() {
        let (svc, _clock) = service();
        let a = mint(&svc, 1);
        let b = mint(&svc, 2);
        svc.revoke(&a);
        assert!(svc.verify(&a.wire, &binding(1), "browser.click").is_err());
        assert!(svc.verify(&b.wire, &binding(2), "browser.click").is_ok());
    }
}
