//! MD5 digest authentication (RFC 2617) for registrar and proxy challenges.
//!
//! Asterisk challenges REGISTER and INVITE with 401/407; the answer is
//! computed here and the session retries the request exactly once.

use super::SipError;

/// Nonce count. Always 1: every retry answers a freshly issued challenge.
const NC: &str = "00000001";

/// Parsed WWW-Authenticate / Proxy-Authenticate value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub algorithm: Option<String>,
    pub qop: Option<String>,
}

/// Challenge and answer header names for a 401 or 407 status.
pub fn header_names(status: u16) -> Option<(&'static str, &'static str)> {
    match status {
        401 => Some(("WWW-Authenticate", "Authorization")),
        407 => Some(("Proxy-Authenticate", "Proxy-Authorization")),
        _ => None,
    }
}

pub fn parse_challenge(value: &str) -> Result<Challenge, SipError> {
    let trimmed = value.trim();
    let rest = trimmed
        .strip_prefix("Digest")
        .or_else(|| trimmed.strip_prefix("digest"))
        .ok_or_else(|| SipError::UnsupportedDigest(format!("not a digest challenge: {value}")))?;

    let mut realm = None;
    let mut nonce = None;
    let mut opaque = None;
    let mut algorithm = None;
    let mut qop = None;
    for (key, val) in split_params(rest) {
        match key.to_ascii_lowercase().as_str() {
            "realm" => realm = Some(val),
            "nonce" => nonce = Some(val),
            "opaque" => opaque = Some(val),
            "algorithm" => algorithm = Some(val),
            "qop" => qop = Some(val),
            _ => {}
        }
    }

    Ok(Challenge {
        realm: realm.ok_or_else(|| SipError::Malformed("digest challenge without realm".into()))?,
        nonce: nonce.ok_or_else(|| SipError::Malformed("digest challenge without nonce".into()))?,
        opaque,
        algorithm,
        qop,
    })
}

/// Builds the Authorization / Proxy-Authorization value answering
/// `challenge` for `method` on `uri`. The cnonce is caller-supplied so the
/// computation stays deterministic under test.
pub fn authorization(
    challenge: &Challenge,
    username: &str,
    password: &str,
    method: &str,
    uri: &str,
    cnonce: &str,
) -> Result<String, SipError> {
    if let Some(alg) = &challenge.algorithm {
        if !alg.eq_ignore_ascii_case("md5") {
            return Err(SipError::UnsupportedDigest(format!("algorithm {alg}")));
        }
    }
    // qop=auth is the only protection level supported; auth-int hashes the
    // body and no deployed registrar requires it.
    let qop = match &challenge.qop {
        Some(offered) => {
            if !offered
                .split(',')
                .map(str::trim)
                .any(|t| t.eq_ignore_ascii_case("auth"))
            {
                return Err(SipError::UnsupportedDigest(format!("qop {offered}")));
            }
            Some("auth")
        }
        None => None,
    };

    let ha1 = h(&format!("{username}:{}:{password}", challenge.realm));
    let ha2 = h(&format!("{method}:{uri}"));
    let response = match qop {
        Some(q) => h(&format!(
            "{ha1}:{}:{NC}:{cnonce}:{q}:{ha2}",
            challenge.nonce
        )),
        None => h(&format!("{ha1}:{}:{ha2}", challenge.nonce)),
    };

    let mut out = format!(
        "Digest username=\"{username}\", realm=\"{}\", nonce=\"{}\", \
         uri=\"{uri}\", response=\"{response}\", algorithm=MD5",
        challenge.realm, challenge.nonce
    );
    if let Some(q) = qop {
        out.push_str(&format!(", qop={q}, nc={NC}, cnonce=\"{cnonce}\""));
    }
    if let Some(opaque) = &challenge.opaque {
        out.push_str(&format!(", opaque=\"{opaque}\""));
    }
    Ok(out)
}

fn h(data: &str) -> String {
    format!("{:x}", md5::compute(data.as_bytes()))
}

/// Splits `key=value, key="quoted, value"` parameter lists, honoring quotes.
fn split_params(s: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut chars = s.chars().peekable();
    loop {
        while let Some(&c) = chars.peek() {
            if c == ',' || c == ' ' || c == '\t' {
                chars.next();
            } else {
                break;
            }
        }
        if chars.peek().is_none() {
            break;
        }
        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' {
                break;
            }
            key.push(c);
            chars.next();
        }
        if chars.next().is_none() {
            break;
        }
        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            for c in chars.by_ref() {
                if c == '"' {
                    break;
                }
                value.push(c);
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                value.push(c);
                chars.next();
            }
        }
        out.push((key.trim().to_string(), value.trim().to_string()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rfc2617_challenge() -> Challenge {
        Challenge {
            realm: "testrealm@host.com".to_string(),
            nonce: "dcd98b7102dd2f0e8b11d0f600bfb0c093".to_string(),
            opaque: Some("5ccc069c403ebaf9f0171e9517f40e41".to_string()),
            algorithm: None,
            qop: Some("auth,auth-int".to_string()),
        }
    }

    #[test]
    fn test_rfc2617_example_vector() {
        // The worked example from RFC 2617 section 3.5.
        let value = authorization(
            &rfc2617_challenge(),
            "Mufasa",
            "Circle Of Life",
            "GET",
            "/dir/index.html",
            "0a4f113b",
        )
        .unwrap();
        assert!(value.contains("response=\"6629faae49393a05397450978507c4ef\""));
        assert!(value.contains("qop=auth"));
        assert!(value.contains("nc=00000001"));
        assert!(value.contains("cnonce=\"0a4f113b\""));
        assert!(value.contains("opaque=\"5ccc069c403ebaf9f0171e9517f40e41\""));
    }

    #[test]
    fn test_parse_challenge() {
        let ch = parse_challenge(
            "Digest algorithm=MD5, realm=\"asterisk\", nonce=\"1764016734/5a1c\", qop=\"auth\"",
        )
        .unwrap();
        assert_eq!(ch.realm, "asterisk");
        assert_eq!(ch.nonce, "1764016734/5a1c");
        assert_eq!(ch.algorithm.as_deref(), Some("MD5"));
        assert_eq!(ch.qop.as_deref(), Some("auth"));
        assert_eq!(ch.opaque, None);
    }

    #[test]
    fn test_parse_challenge_quoted_comma() {
        let ch = parse_challenge("Digest realm=\"a, b\", nonce=\"n\"").unwrap();
        assert_eq!(ch.realm, "a, b");
        assert_eq!(ch.nonce, "n");
    }

    #[test]
    fn test_parse_challenge_requires_digest_scheme() {
        assert!(parse_challenge("Basic realm=\"asterisk\"").is_err());
        assert!(parse_challenge("Digest nonce=\"n\"").is_err());
    }

    #[test]
    fn test_without_qop_omits_nonce_count() {
        let ch = Challenge {
            realm: "asterisk".to_string(),
            nonce: "n1".to_string(),
            opaque: None,
            algorithm: Some("MD5".to_string()),
            qop: None,
        };
        let value = authorization(&ch, "100", "s3cret", "REGISTER", "sip:pbx", "c1").unwrap();
        assert!(value.starts_with("Digest username=\"100\""));
        assert!(!value.contains("qop="));
        assert!(!value.contains("nc="));
        assert!(!value.contains("cnonce="));
    }

    #[test]
    fn test_rejects_unsupported_parameters() {
        let mut ch = rfc2617_challenge();
        ch.algorithm = Some("SHA-256".to_string());
        assert!(authorization(&ch, "u", "p", "REGISTER", "sip:x", "c").is_err());

        let mut ch = rfc2617_challenge();
        ch.qop = Some("auth-int".to_string());
        assert!(authorization(&ch, "u", "p", "REGISTER", "sip:x", "c").is_err());
    }

    #[test]
    fn test_header_names() {
        assert_eq!(
            header_names(401),
            Some(("WWW-Authenticate", "Authorization"))
        );
        assert_eq!(
            header_names(407),
            Some(("Proxy-Authenticate", "Proxy-Authorization"))
        );
        assert_eq!(header_names(486), None);
    }
}
