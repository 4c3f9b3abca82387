use rand::RngCore;
use sha2::{Digest, Sha256};
use url::Url;

/// Length of a session token in hex characters.
pub const SESSION_TOKEN_LEN: usize = 14;

/// Mint a fresh session token for a first-contact visitor.
///
/// Formula: sha256(now_nanos + nonce + ip + user_agent)[0..7] as 14 hex chars.
/// The token only has to be unique enough to deduplicate hosts within one
/// counting period; it carries no identity once the period is reset.
pub fn new_session_token(ip: &str, user_agent: &str) -> String {
    let mut nonce = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut nonce);
    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(nanos.to_be_bytes());
    hasher.update(nonce);
    hasher.update(ip.as_bytes());
    hasher.update(user_agent.as_bytes());
    let hash = hasher.finalize();
    hex::encode(&hash[..SESSION_TOKEN_LEN / 2])
}

/// Scheme the embedding page was served with, so redirects keep it.
///
/// Falls back to `https` when the referrer is absent or unparsable.
pub fn referrer_scheme(referrer: &str) -> String {
    match Url::parse(referrer) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => url.scheme().to_string(),
        _ => "https".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_token_is_14_hex_chars() {
        let token = new_session_token("1.2.3.4", "Mozilla/5.0 Chrome/120");
        assert_eq!(token.len(), SESSION_TOKEN_LEN);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn session_tokens_differ_between_calls() {
        let a = new_session_token("1.2.3.4", "Mozilla/5.0");
        let b = new_session_token("1.2.3.4", "Mozilla/5.0");
        assert_ne!(a, b);
    }

    #[test]
    fn referrer_scheme_http() {
        assert_eq!(referrer_scheme("http://example.com/page"), "http");
    }

    #[test]
    fn referrer_scheme_defaults_to_https() {
        assert_eq!(referrer_scheme(""), "https");
        assert_eq!(referrer_scheme("not a url"), "https");
        assert_eq!(referrer_scheme("ftp://example.com/"), "https");
    }
}
