//! Resource allocation: instance identifiers, host ports, and credential
//! material.
//!
//! The in-memory used-port set is owned by the caller (typically rebuilt
//! from the registry at startup) and passed in by reference on every
//! allocation so the allocator itself stays stateless and easy to test.

#![forbid(unsafe_code)]

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use rand::Rng;
use rand::distributions::Alphanumeric;
use sbo_proto::{ErrorKind, PortRole, PortSet};
use sha2::Sha256;
use std::collections::HashSet;
use std::net::TcpListener;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum AllocatorError {
    #[error("exhausted {attempts} attempts allocating a port for {role:?}")]
    PortExhausted { role: PortRole, attempts: u32 },
    #[error("exhausted {attempts} attempts generating a unique instance id")]
    IdExhausted { attempts: u32 },
}

impl AllocatorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PortExhausted { .. } => ErrorKind::Capacity,
            Self::IdExhausted { .. } => ErrorKind::Capacity,
        }
    }
}

pub type Result<T> = std::result::Result<T, AllocatorError>;

const MAX_PORT_ATTEMPTS: u32 = 100;
const MAX_ID_ATTEMPTS: u32 = 100;

// ─── Identifier allocation ────────────────────────────────────────────────────

/// Generate a short, URL-safe, opaque instance id not present in `existing`.
/// Regenerates on collision, up to [`MAX_ID_ATTEMPTS`].
pub fn allocate_instance_id(existing: &HashSet<String>) -> Result<String> {
    for _ in 0..MAX_ID_ATTEMPTS {
        let candidate = random_token(10);
        if !existing.contains(&candidate) {
            return Ok(candidate);
        }
    }
    Err(AllocatorError::IdExhausted { attempts: MAX_ID_ATTEMPTS })
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

// ─── Port allocation ──────────────────────────────────────────────────────────

/// Attempt to allocate one port for `role`, excluding anything in
/// `used` and verifying the candidate is actually bindable on loopback.
pub fn allocate_port(role: PortRole, used: &HashSet<u16>) -> Result<u16> {
    let range = role.range();
    let mut rng = rand::thread_rng();
    for _ in 0..MAX_PORT_ATTEMPTS {
        let candidate = rng.gen_range(range.low..=range.high);
        if used.contains(&candidate) {
            continue;
        }
        if port_is_bindable(candidate) {
            return Ok(candidate);
        }
    }
    Err(AllocatorError::PortExhausted { role, attempts: MAX_PORT_ATTEMPTS })
}

fn port_is_bindable(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Allocate a full [`PortSet`] for a new instance, given the currently
/// used ports (rebuilt from the registry on startup, then extended as
/// instances are created).
pub fn allocate_port_set(used: &HashSet<u16>) -> Result<PortSet> {
    let gateway_http = allocate_port(PortRole::GatewayHttp, used)?;
    let mut used_extended = used.clone();
    used_extended.insert(gateway_http);

    let gateway_https = allocate_port(PortRole::GatewayHttps, &used_extended)?;
    used_extended.insert(gateway_https);

    let database_external = allocate_port(PortRole::DatabaseExternal, &used_extended)?;
    used_extended.insert(database_external);

    let analytics = allocate_port(PortRole::Analytics, &used_extended)?;

    Ok(PortSet { gateway_http, gateway_https, database_external, analytics })
}

// ─── Credential generation ────────────────────────────────────────────────────

/// 32 printable characters with at least one of each of
/// {upper, lower, digit, symbol}.
pub fn generate_database_password() -> String {
    const SYMBOLS: &[u8] = b"!@#$%^&*()-_=+";
    let mut rng = rand::thread_rng();

    let mut chars: Vec<char> = vec![
        (b'A' + rng.gen_range(0..26)) as char,
        (b'a' + rng.gen_range(0..26)) as char,
        (b'0' + rng.gen_range(0..10)) as char,
        SYMBOLS[rng.gen_range(0..SYMBOLS.len())] as char,
    ];

    const POOL: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!@#$%^&*()-_=+";
    for _ in chars.len()..32 {
        chars.push(POOL[rng.gen_range(0..POOL.len())] as char);
    }

    // Shuffle so the four guaranteed classes aren't always in the first slots.
    for i in (1..chars.len()).rev() {
        let j = rng.gen_range(0..=i);
        chars.swap(i, j);
    }

    chars.into_iter().collect()
}

/// 64 random hex characters (32 random bytes, hex-encoded).
pub fn generate_signing_secret() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    hex::encode(bytes)
}

/// Role carried in the `role` claim of the derived API tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenRole {
    Anon,
    ServiceRole,
}

impl TokenRole {
    fn as_str(self) -> &'static str {
        match self {
            Self::Anon => "anon",
            Self::ServiceRole => "service_role",
        }
    }
}

/// Produce a JWT-shaped string: `iss=supabase`, `iat=now`, `exp=now+365d`,
/// `role` set to `token_role`, signed with `signing_secret` via HMAC-SHA256.
pub fn derive_api_token(signing_secret: &str, token_role: TokenRole) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);

    let now = chrono::Utc::now().timestamp();
    let exp = now + 365 * 24 * 60 * 60;
    let payload_json = serde_json::json!({
        "iss": "supabase",
        "iat": now,
        "exp": exp,
        "role": token_role.as_str(),
    });
    let payload = URL_SAFE_NO_PAD.encode(payload_json.to_string());

    let signing_input = format!("{header}.{payload}");
    let signature = sign_hmac(signing_secret, &signing_input);

    format!("{signing_input}.{signature}")
}

fn sign_hmac(secret: &str, message: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(message.as_bytes());
    URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
}

/// Verify a token produced by [`derive_api_token`] round-trips against
/// `signing_secret` (used by the auth deep-probe, §4.F).
pub fn verify_api_token(signing_secret: &str, token: &str) -> bool {
    let mut parts = token.splitn(3, '.');
    let (Some(header), Some(payload), Some(signature)) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    let expected = sign_hmac(signing_secret, &format!("{header}.{payload}"));
    expected == signature
}

pub fn generate_dashboard_username() -> String {
    format!("admin-{}", random_token(6))
}

pub fn generate_dashboard_password() -> String {
    generate_database_password()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_instance_id_avoids_collisions() {
        let mut existing = HashSet::new();
        let first = allocate_instance_id(&existing).unwrap();
        existing.insert(first.clone());
        let second = allocate_instance_id(&existing).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_allocate_port_within_range() {
        let used = HashSet::new();
        let port = allocate_port(PortRole::GatewayHttp, &used).unwrap();
        assert!(PortRole::GatewayHttp.range().contains(port));
    }

    #[test]
    fn test_allocate_port_excludes_used() {
        let mut used = HashSet::new();
        let first = allocate_port(PortRole::Analytics, &used).unwrap();
        used.insert(first);
        let second = allocate_port(PortRole::Analytics, &used).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_allocate_port_set_disjoint_roles() {
        let used = HashSet::new();
        let ports = allocate_port_set(&used).unwrap();
        assert!(ports.within_declared_ranges());
    }

    #[test]
    fn test_password_has_required_classes() {
        let pw = generate_database_password();
        assert_eq!(pw.len(), 32);
        assert!(pw.chars().any(|c| c.is_ascii_uppercase()));
        assert!(pw.chars().any(|c| c.is_ascii_lowercase()));
        assert!(pw.chars().any(|c| c.is_ascii_digit()));
        assert!(pw.chars().any(|c| !c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_signing_secret_is_64_hex_chars() {
        let secret = generate_signing_secret();
        assert_eq!(secret.len(), 64);
        assert!(secret.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_derived_tokens_distinct_per_secret() {
        let secret_a = generate_signing_secret();
        let secret_b = generate_signing_secret();
        let token_a = derive_api_token(&secret_a, TokenRole::Anon);
        let token_b = derive_api_token(&secret_b, TokenRole::Anon);
        assert_ne!(token_a, token_b);
    }

    #[test]
    fn test_token_round_trip_verification() {
        let secret = generate_signing_secret();
        let token = derive_api_token(&secret, TokenRole::ServiceRole);
        assert!(verify_api_token(&secret, &token));
        assert!(!verify_api_token("wrong-secret", &token));
    }
}
