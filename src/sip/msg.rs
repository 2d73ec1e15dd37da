//! SIP message model: requests, responses, headers, and the header surgery
//! the signaling session needs.
//!
//! Parsing is line based: start line, headers until the first blank line,
//! body verbatim. Obsolete header line folding and compact header names are
//! not supported; Asterisk emits neither on WebSocket transports.

use std::fmt;

use uuid::Uuid;

use super::SipError;

pub const SIP_VERSION: &str = "SIP/2.0";

/// Advertised in Allow on requests and on replies to OPTIONS.
pub const ALLOW: &str = "INVITE, ACK, CANCEL, BYE, OPTIONS, NOTIFY";

pub const USER_AGENT: &str = concat!("softphone-cli/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Generated identifiers
// ---------------------------------------------------------------------------

/// Transaction branch with the RFC 3261 magic cookie.
pub fn new_branch() -> String {
    format!("z9hG4bK{}", Uuid::new_v4().simple())
}

/// From/To tag.
pub fn new_tag() -> String {
    Uuid::new_v4().simple().to_string()[..10].to_string()
}

pub fn new_call_id() -> String {
    Uuid::new_v4().to_string()
}

/// Via host for WebSocket clients. RFC 7118 §5.2 allows a client without a
/// meaningful transport address to advertise a random hostname under the
/// ".invalid" domain.
pub fn new_via_host() -> String {
    format!("{}.invalid", &Uuid::new_v4().simple().to_string()[..12])
}

// ---------------------------------------------------------------------------
// Methods
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Register,
    Invite,
    Ack,
    Cancel,
    Bye,
    Options,
    Notify,
    Other(String),
}

impl Method {
    pub fn from_token(token: &str) -> Self {
        match token {
            "REGISTER" => Method::Register,
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "CANCEL" => Method::Cancel,
            "BYE" => Method::Bye,
            "OPTIONS" => Method::Options,
            "NOTIFY" => Method::Notify,
            other => Method::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::Register => "REGISTER",
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Cancel => "CANCEL",
            Method::Bye => "BYE",
            Method::Options => "OPTIONS",
            Method::Notify => "NOTIFY",
            Method::Other(s) => s,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

/// Ordered header list. Names compare case-insensitively; duplicates are
/// kept in arrival order (Via and Record-Route repeat).
#[derive(Debug, Clone, Default)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn push(&mut self, name: &str, value: impl Into<String>) {
        self.0.push((name.to_string(), value.into()));
    }

    /// First value of `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values of `name`, in arrival order.
    pub fn all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.0
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replaces the first value of `name`, or appends if absent.
    pub fn set(&mut self, name: &str, value: &str) {
        match self.0.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some((_, v)) => *v = value.to_string(),
            None => self.push(name, value),
        }
    }

    fn write_to(&self, out: &mut String) {
        for (name, value) in &self.0 {
            // Content-Length is recomputed at serialization time.
            if name.eq_ignore_ascii_case("Content-Length") {
                continue;
            }
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
    }
}

// ---------------------------------------------------------------------------
// Request / Response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub uri: String,
    pub headers: Headers,
    pub body: String,
}

impl Request {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Request {
            method,
            uri: uri.into(),
            headers: Headers::default(),
            body: String::new(),
        }
    }

    pub fn set_body(&mut self, content_type: &str, body: String) {
        self.headers.set("Content-Type", content_type);
        self.body = body;
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.get("Call-ID")
    }

    pub fn cseq(&self) -> Option<(u32, Method)> {
        self.headers.get("CSeq").and_then(parse_cseq)
    }

    /// Branch parameter of the topmost Via.
    pub fn branch(&self) -> Option<&str> {
        self.headers.get("Via").and_then(|v| semi_param(v, "branch"))
    }

    pub fn to_wire(&self) -> String {
        let mut out = format!("{} {} {}\r\n", self.method, self.uri, SIP_VERSION);
        self.headers.write_to(&mut out);
        out.push_str(&format!("Content-Length: {}\r\n\r\n", self.body.len()));
        out.push_str(&self.body);
        out
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: String,
}

impl Response {
    pub fn new(status: u16, reason: &str) -> Self {
        Response {
            status,
            reason: reason.to_string(),
            headers: Headers::default(),
            body: String::new(),
        }
    }

    /// Response to `req` with the transaction headers copied over
    /// (RFC 3261 §8.2.6): all Via values, Record-Route, From, To, Call-ID
    /// and CSeq. The caller adds To tags, Contact and body as needed.
    pub fn reply_to(req: &Request, status: u16, reason: &str) -> Self {
        let mut resp = Response::new(status, reason);
        for via in req.headers.all("Via") {
            resp.headers.push("Via", via);
        }
        for route in req.headers.all("Record-Route") {
            resp.headers.push("Record-Route", route);
        }
        if let Some(v) = req.headers.get("From") {
            resp.headers.push("From", v);
        }
        if let Some(v) = req.headers.get("To") {
            resp.headers.push("To", v);
        }
        if let Some(v) = req.headers.get("Call-ID") {
            resp.headers.push("Call-ID", v);
        }
        if let Some(v) = req.headers.get("CSeq") {
            resp.headers.push("CSeq", v);
        }
        resp
    }

    /// Appends `;tag=` to the To value unless one is already present.
    pub fn set_to_tag(&mut self, tag: &str) {
        if let Some(to) = self.headers.get("To") {
            if addr_param(to, "tag").is_none() {
                let tagged = format!("{to};tag={tag}");
                self.headers.set("To", &tagged);
            }
        }
    }

    pub fn set_body(&mut self, content_type: &str, body: String) {
        self.headers.set("Content-Type", content_type);
        self.body = body;
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.get("Call-ID")
    }

    pub fn cseq(&self) -> Option<(u32, Method)> {
        self.headers.get("CSeq").and_then(parse_cseq)
    }

    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.status)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn to_wire(&self) -> String {
        let mut out = format!("{} {} {}\r\n", SIP_VERSION, self.status, self.reason);
        self.headers.write_to(&mut out);
        out.push_str(&format!("Content-Length: {}\r\n\r\n", self.body.len()));
        out.push_str(&self.body);
        out
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    pub fn parse(raw: &str) -> Result<Message, SipError> {
        let (head, body) = split_head(raw);
        let mut lines = head.lines();
        let start = lines
            .next()
            .filter(|l| !l.trim().is_empty())
            .ok_or_else(|| SipError::Malformed("empty message".into()))?;

        let mut headers = Headers::default();
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| SipError::Malformed(format!("bad header line: {line:?}")))?;
            headers.push(name.trim(), value.trim());
        }

        if let Some(rest) = start.strip_prefix("SIP/2.0 ") {
            let (code, reason) = rest.split_once(' ').unwrap_or((rest, ""));
            let status: u16 = code
                .parse()
                .map_err(|_| SipError::Malformed(format!("bad status line: {start:?}")))?;
            Ok(Message::Response(Response {
                status,
                reason: reason.trim().to_string(),
                headers,
                body: body.to_string(),
            }))
        } else {
            let mut parts = start.split_whitespace();
            let (method, uri, version) = match (parts.next(), parts.next(), parts.next()) {
                (Some(m), Some(u), Some(v)) => (m, u, v),
                _ => return Err(SipError::Malformed(format!("bad request line: {start:?}"))),
            };
            if version != SIP_VERSION {
                return Err(SipError::Malformed(format!("bad request line: {start:?}")));
            }
            Ok(Message::Request(Request {
                method: Method::from_token(method),
                uri: uri.to_string(),
                headers,
                body: body.to_string(),
            }))
        }
    }
}

fn split_head(raw: &str) -> (&str, &str) {
    if let Some(idx) = raw.find("\r\n\r\n") {
        (&raw[..idx], &raw[idx + 4..])
    } else if let Some(idx) = raw.find("\n\n") {
        (&raw[..idx], &raw[idx + 2..])
    } else {
        (raw, "")
    }
}

// ---------------------------------------------------------------------------
// Header value helpers
// ---------------------------------------------------------------------------

/// `CSeq: 2 INVITE` -> `(2, Method::Invite)`.
pub fn parse_cseq(value: &str) -> Option<(u32, Method)> {
    let mut parts = value.split_whitespace();
    let seq = parts.next()?.parse().ok()?;
    let method = Method::from_token(parts.next()?);
    Some((seq, method))
}

/// The addr-spec of a From/To/Contact value: the URI inside `<...>`, or the
/// value up to the first `;` when no brackets are used.
pub fn addr_spec(value: &str) -> &str {
    if let (Some(start), Some(end)) = (value.find('<'), value.find('>')) {
        if start < end {
            return value[start + 1..end].trim();
        }
    }
    value.split(';').next().unwrap_or(value).trim()
}

/// A parameter that applies to the header value itself (after the closing
/// `>` when brackets are used), e.g. the From/To tag or a Contact expires.
pub fn addr_param<'a>(value: &'a str, name: &str) -> Option<&'a str> {
    let params = match value.find('>') {
        Some(idx) => &value[idx + 1..],
        None => value,
    };
    semi_param(params, name)
}

/// `;name=value` parameter lookup on a raw parameter list, quote-stripped.
pub fn semi_param<'a>(s: &'a str, name: &str) -> Option<&'a str> {
    for part in s.split(';') {
        if let Some((k, v)) = part.split_once('=') {
            if k.trim().eq_ignore_ascii_case(name) {
                return Some(v.trim().trim_matches('"'));
            }
        }
    }
    None
}

/// User part of a SIP URI: `sip:0501234567@pbx;user=phone` -> `0501234567`.
/// Returns None for URIs without a user part.
pub fn uri_user(uri: &str) -> Option<&str> {
    let rest = uri
        .strip_prefix("sips:")
        .or_else(|| uri.strip_prefix("sip:"))
        .unwrap_or(uri);
    let (userinfo, _) = rest.split_once('@')?;
    let user = userinfo.split(':').next().unwrap_or(userinfo);
    if user.is_empty() {
        None
    } else {
        Some(user)
    }
}

/// Display name of a From/To value, with surrounding quotes removed.
pub fn display_name(value: &str) -> Option<String> {
    let idx = value.find('<')?;
    let name = value[..idx].trim().trim_matches('"').trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INBOUND_INVITE: &str = concat!(
        "INVITE sip:100@abcdef123456.invalid;transport=ws SIP/2.0\r\n",
        "Via: SIP/2.0/WSS 192.168.1.10:8089;branch=z9hG4bK1234abcd\r\n",
        "Record-Route: <sip:192.168.1.10:8089;transport=ws;lr>\r\n",
        "From: \"Dispatch West\" <sip:0501234567@192.168.1.10>;tag=as5fe59a12\r\n",
        "To: <sip:100@192.168.1.10>\r\n",
        "Call-ID: 7acb1fe4708d4e0a@192.168.1.10\r\n",
        "CSeq: 102 INVITE\r\n",
        "Contact: <sip:0501234567@192.168.1.10:8089;transport=ws>\r\n",
        "Content-Type: application/sdp\r\n",
        "Content-Length: 24\r\n",
        "\r\n",
        "v=0\r\nm=audio 9 RTP/AVP 0"
    );

    #[test]
    fn test_parse_request_with_body() {
        let msg = Message::parse(INBOUND_INVITE).unwrap();
        let req = match msg {
            Message::Request(r) => r,
            other => panic!("expected request, got {other:?}"),
        };
        assert_eq!(req.method, Method::Invite);
        assert_eq!(req.uri, "sip:100@abcdef123456.invalid;transport=ws");
        assert_eq!(req.call_id(), Some("7acb1fe4708d4e0a@192.168.1.10"));
        assert_eq!(req.cseq(), Some((102, Method::Invite)));
        assert_eq!(req.branch(), Some("z9hG4bK1234abcd"));
        assert_eq!(req.body, "v=0\r\nm=audio 9 RTP/AVP 0");
    }

    #[test]
    fn test_parse_response() {
        let raw = concat!(
            "SIP/2.0 401 Unauthorized\r\n",
            "Via: SIP/2.0/WSS x.invalid;branch=z9hG4bKdeadbeef\r\n",
            "Call-ID: reg-1\r\n",
            "CSeq: 1 REGISTER\r\n",
            "WWW-Authenticate: Digest realm=\"asterisk\", nonce=\"abc\"\r\n",
            "\r\n"
        );
        let msg = Message::parse(raw).unwrap();
        let resp = match msg {
            Message::Response(r) => r,
            other => panic!("expected response, got {other:?}"),
        };
        assert_eq!(resp.status, 401);
        assert_eq!(resp.reason, "Unauthorized");
        assert_eq!(resp.cseq(), Some((1, Method::Register)));
        assert!(resp.body.is_empty());
    }

    #[test]
    fn test_wire_round_trip() {
        let mut req = Request::new(Method::Register, "sip:pbx.example.org");
        req.headers.push(
            "Via",
            "SIP/2.0/WSS ab12.invalid;branch=z9hG4bKfeed",
        );
        req.headers.push("From", "<sip:100@pbx.example.org>;tag=xyz");
        req.headers.push("To", "<sip:100@pbx.example.org>");
        req.headers.push("Call-ID", "round-trip");
        req.headers.push("CSeq", "1 REGISTER");

        let wire = req.to_wire();
        assert!(wire.starts_with("REGISTER sip:pbx.example.org SIP/2.0\r\n"));
        assert!(wire.ends_with("Content-Length: 0\r\n\r\n"));

        let reparsed = match Message::parse(&wire).unwrap() {
            Message::Request(r) => r,
            other => panic!("expected request, got {other:?}"),
        };
        assert_eq!(reparsed.method, Method::Register);
        assert_eq!(reparsed.call_id(), Some("round-trip"));
        assert_eq!(reparsed.cseq(), Some((1, Method::Register)));
    }

    #[test]
    fn test_content_length_recomputed() {
        let mut resp = Response::new(200, "OK");
        resp.headers.push("Content-Length", "999");
        resp.set_body("application/sdp", "v=0".to_string());
        let wire = resp.to_wire();
        assert!(wire.contains("Content-Length: 3\r\n"));
        assert!(!wire.contains("999"));
    }

    #[test]
    fn test_header_lookup_ignores_case() {
        let mut h = Headers::default();
        h.push("Call-ID", "abc");
        assert_eq!(h.get("call-id"), Some("abc"));
        h.set("CALL-ID", "def");
        assert_eq!(h.get("Call-ID"), Some("def"));
        assert_eq!(h.all("call-Id").count(), 1);
    }

    #[test]
    fn test_reply_copies_transaction_headers() {
        let req = match Message::parse(INBOUND_INVITE).unwrap() {
            Message::Request(r) => r,
            other => panic!("expected request, got {other:?}"),
        };
        let mut resp = Response::reply_to(&req, 180, "Ringing");
        resp.set_to_tag("local1");

        assert_eq!(
            resp.headers.get("Via"),
            Some("SIP/2.0/WSS 192.168.1.10:8089;branch=z9hG4bK1234abcd")
        );
        assert!(resp.headers.get("Record-Route").is_some());
        assert_eq!(resp.call_id(), req.call_id());
        assert_eq!(resp.cseq(), Some((102, Method::Invite)));
        assert_eq!(
            resp.headers.get("To"),
            Some("<sip:100@192.168.1.10>;tag=local1")
        );

        // A second tag application must not stack another tag.
        resp.set_to_tag("local2");
        assert_eq!(
            resp.headers.get("To"),
            Some("<sip:100@192.168.1.10>;tag=local1")
        );
    }

    #[test]
    fn test_addr_helpers() {
        let from = "\"Dispatch West\" <sip:0501234567@pbx;user=phone>;tag=as5fe59a12";
        assert_eq!(addr_spec(from), "sip:0501234567@pbx;user=phone");
        assert_eq!(addr_param(from, "tag"), Some("as5fe59a12"));
        assert_eq!(display_name(from), Some("Dispatch West".to_string()));
        assert_eq!(uri_user(addr_spec(from)), Some("0501234567"));

        let bare = "sip:200@pbx;tag=9";
        assert_eq!(addr_spec(bare), "sip:200@pbx");
        assert_eq!(addr_param(bare, "tag"), Some("9"));
        assert_eq!(display_name(bare), None);

        assert_eq!(uri_user("sip:pbx.example.org"), None);
    }

    #[test]
    fn test_generated_identifiers() {
        let branch = new_branch();
        assert!(branch.starts_with("z9hG4bK"));
        assert_ne!(branch, new_branch());

        let host = new_via_host();
        assert!(host.ends_with(".invalid"));

        assert_eq!(new_tag().len(), 10);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Message::parse("").is_err());
        assert!(Message::parse("hello world\r\n\r\n").is_err());
        assert!(Message::parse("SIP/2.0 abc Nope\r\n\r\n").is_err());
    }
}
