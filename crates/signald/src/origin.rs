use regex::Regex;
use tokio_tungstenite::tungstenite::http::{header, Request, Uri};

/// Which `Origin` headers may open a WebSocket.
///
/// Requests without an `Origin` header are always allowed: browsers always
/// send one, other clients can set it to anything anyway.
#[derive(Debug, Clone)]
pub enum OriginPolicy {
    /// The origin's host must equal the `Host` header.
    SameOrigin,
    /// The origin must match the pattern (unanchored unless the pattern is).
    Pattern(Regex),
}

impl OriginPolicy {
    /// Build the policy from the configured pattern, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if `pattern` is not a valid regex.
    pub fn new(pattern: Option<&str>) -> Result<Self, regex::Error> {
        match pattern {
            Some(p) => Ok(Self::Pattern(Regex::new(p)?)),
            None => Ok(Self::SameOrigin),
        }
    }

    /// Returns `true` if the handshake request may proceed.
    #[must_use]
    pub fn allows(&self, req: &Request<()>) -> bool {
        let Some(origin) = req.headers().get(header::ORIGIN) else {
            return true;
        };
        let Ok(origin) = origin.to_str() else {
            return false;
        };
        match self {
            Self::Pattern(re) => re.is_match(origin),
            Self::SameOrigin => {
                let Some(host) = req.headers().get(header::HOST).and_then(|h| h.to_str().ok())
                else {
                    return false;
                };
                origin
                    .parse::<Uri>()
                    .ok()
                    .and_then(|uri| uri.authority().map(|a| a.as_str().to_owned()))
                    .is_some_and(|authority| authority.eq_ignore_ascii_case(host))
            }
        }
    }
}
