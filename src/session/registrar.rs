//! REGISTER lifecycle against the PBX.
//!
//! Builds the initial REGISTER, answers one digest challenge per attempt,
//! refreshes at half the granted interval and un-registers with
//! `Expires: 0` on shutdown. All requests share one Call-ID and From tag
//! with a climbing CSeq, as RFC 3261 requires for a registration.

use std::time::Duration;

use crate::config::{Config, REGISTER_EXPIRES};
use crate::sip::auth::{self, Challenge};
use crate::sip::msg::{self, Method, Request, Response};
use crate::sip::SipError;

pub struct Registrar {
    domain: String,
    extension: String,
    secret: String,
    /// Stable Via/Contact host for this client instance (RFC 7118).
    via_host: String,
    call_id: String,
    from_tag: String,
    cseq: u32,
    /// Registration interval granted by the PBX.
    expires: u32,
}

impl Registrar {
    pub fn new(config: &Config, domain: &str) -> Self {
        Registrar {
            domain: domain.to_string(),
            extension: config.extension.clone(),
            secret: config.secret.clone(),
            via_host: msg::new_via_host(),
            call_id: msg::new_call_id(),
            from_tag: msg::new_tag(),
            cseq: 0,
            expires: REGISTER_EXPIRES,
        }
    }

    /// Address of record, `extension@domain`.
    pub fn aor(&self) -> String {
        format!("{}@{}", self.extension, self.domain)
    }

    /// Our SIP URI.
    pub fn local_uri(&self) -> String {
        format!("sip:{}@{}", self.extension, self.domain)
    }

    /// Contact URI advertised to the PBX; `transport=ws` routes calls
    /// back over this WebSocket.
    pub fn contact_uri(&self) -> String {
        format!("sip:{}@{};transport=ws", self.extension, self.via_host)
    }

    pub fn via_host(&self) -> &str {
        &self.via_host
    }

    pub fn credentials(&self) -> (&str, &str) {
        (&self.extension, &self.secret)
    }

    /// True when `call_id` belongs to the registration dialog.
    pub fn owns(&self, call_id: &str) -> bool {
        self.call_id == call_id
    }

    /// Fresh (re-)REGISTER.
    pub fn request(&mut self) -> Request {
        self.base_request(self.expires)
    }

    /// Un-REGISTER.
    pub fn unregister(&mut self) -> Request {
        self.base_request(0)
    }

    /// REGISTER answering `challenge` from a 401 or 407 with the given
    /// status. The answer goes in Authorization or Proxy-Authorization
    /// accordingly.
    pub fn authenticated(&mut self, status: u16, challenge: &Challenge) -> Result<Request, SipError> {
        let mut request = self.base_request(self.expires);
        let answer_header = match auth::header_names(status) {
            Some((_, answer)) => answer,
            None => return Err(SipError::Malformed(format!("status {status} is not a challenge"))),
        };
        let uri = request.uri.clone();
        let value = auth::authorization(
            challenge,
            &self.extension,
            &self.secret,
            "REGISTER",
            &uri,
            &msg::new_tag(),
        )?;
        request.headers.push(answer_header, value);
        Ok(request)
    }

    /// Record the interval the PBX granted in a 200 and return the delay
    /// until the next refresh (half the interval).
    pub fn apply_grant(&mut self, response: &Response) -> Duration {
        let granted = response
            .headers
            .get("Expires")
            .and_then(|v| v.trim().parse::<u32>().ok())
            .or_else(|| {
                // Some registrars put the expiry on the Contact instead.
                response
                    .headers
                    .get("Contact")
                    .and_then(|c| msg::addr_param(c, "expires"))
                    .and_then(|v| v.parse::<u32>().ok())
            });
        if let Some(value) = granted {
            if value > 0 {
                self.expires = value;
            }
        }
        self.refresh_interval()
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.expires / 2).max(1))
    }

    fn base_request(&mut self, expires: u32) -> Request {
        self.cseq += 1;
        let mut request = Request::new(Method::Register, format!("sip:{}", self.domain));
        request.headers.push(
            "Via",
            format!("SIP/2.0/WSS {};branch={}", self.via_host, msg::new_branch()),
        );
        request.headers.push("Max-Forwards", "70");
        request.headers.push(
            "From",
            format!("<sip:{}@{}>;tag={}", self.extension, self.domain, self.from_tag),
        );
        request
            .headers
            .push("To", format!("<sip:{}@{}>", self.extension, self.domain));
        request.headers.push("Call-ID", self.call_id.clone());
        request.headers.push("CSeq", format!("{} REGISTER", self.cseq));
        request
            .headers
            .push("Contact", format!("<{}>", self.contact_uri()));
        request.headers.push("Expires", expires.to_string());
        request.headers.push("Allow", msg::ALLOW);
        request.headers.push("User-Agent", msg::USER_AGENT);
        request
    }
}

// ---------------------------------------------------------------------------
