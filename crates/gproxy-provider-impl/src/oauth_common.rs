//! Shared PKCE plumbing for the two OAuth-capable providers (§4.3). Each
//! provider module keeps its own pending table (state id -> verifier +
//! redirect url), since the provider-specific extras attached to that
//! table differ, but the primitives — verifier/challenge generation, a
//! random state token — are identical.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use sha2::Digest;

pub fn generate_code_verifier() -> String {
    let mut bytes = [0u8; 64];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn generate_code_challenge(verifier: &str) -> String {
    let digest = sha2::Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

pub fn generate_state() -> String {
    let mut bytes = [0u8; 24];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Pulls one `key=value` pair out of a raw query string, URL-decoding the
/// value. Both OAuth callback endpoints accept either discrete `code`/
/// `state` parameters or a single `callback_url` carrying both, since a
/// user pasting a redirected URL is as common as the browser hitting the
/// loopback endpoint directly.
pub fn parse_query_value(query: Option<&str>, key: &str) -> Option<String> {
    let raw = query?;
    for pair in raw.split('&') {
        let mut iter = pair.splitn(2, '=');
        let k = iter.next().unwrap_or_default();
        if k != key {
            continue;
        }
        let v = iter.next().unwrap_or_default();
        let decoded = urlencoding::decode(v).ok()?;
        let value = decoded.trim();
        if value.is_empty() {
            return None;
        }
        return Some(value.to_string());
    }
    None
}

pub fn extract_code_state_from_callback_url(callback_url: &str) -> (Option<String>, Option<String>) {
    let raw = callback_url.trim();
    let query = match raw.find('?') {
        Some(idx) => &raw[idx + 1..],
        None => raw,
    };
    let query = query.split('#').next().unwrap_or(query);
    if query.is_empty() {
        return (None, None);
    }
    (
        parse_query_value(Some(query), "code"),
        parse_query_value(Some(query), "state"),
    )
}

/// Resolves `code`/`state` from either discrete query params or a
/// `callback_url` param, preferring the discrete ones when both are present.
pub fn resolve_manual_code_and_state(query: Option<&str>) -> Result<(String, Option<String>), &'static str> {
    let mut code = parse_query_value(query, "code");
    let mut state = parse_query_value(query, "state");
    if let Some(callback_url) = parse_query_value(query, "callback_url") {
        let (code_from_callback, state_from_callback) = extract_code_state_from_callback_url(&callback_url);
        code = code.or(code_from_callback);
        state = state.or(state_from_callback);
    }
    let Some(code) = code else {
        return Err("missing code");
    };
    Ok((code, state))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifier_is_at_least_32_bytes_of_entropy() {
        let verifier = generate_code_verifier();
        // 64 raw bytes, base64url (no padding) encodes to at least 64 chars.
        assert!(verifier.len() >= 64);
    }

    #[test]
    fn challenge_is_deterministic_given_a_verifier() {
        let verifier = "fixed-verifier-value";
        assert_eq!(generate_code_challenge(verifier), generate_code_challenge(verifier));
    }

    #[test]
    fn callback_url_extracts_code_and_state() {
        let (code, state) = extract_code_state_from_callback_url("http://localhost:1455/cb?code=abc&state=st_1");
        assert_eq!(code.as_deref(), Some("abc"));
        assert_eq!(state.as_deref(), Some("st_1"));
    }

    #[test]
    fn manual_code_is_preferred_over_callback_url_code() {
        let parsed = resolve_manual_code_and_state(Some(
            "code=direct&callback_url=http%3A%2F%2Flocalhost%2Fcb%3Fcode%3Dother%26state%3Ds2",
        ))
        .unwrap();
        assert_eq!(parsed.0, "direct");
        assert_eq!(parsed.1.as_deref(), Some("s2"));
    }

    #[test]
    fn manual_parse_requires_code() {
        assert_eq!(resolve_manual_code_and_state(Some("state=only")), Err("missing code"));
    }
}
