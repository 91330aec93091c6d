//! URI and operator-input validation

use url::Url;

/// An `acct:user@host` identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcctUri {
    pub user: String,
    pub host: String,
}

impl AcctUri {
    pub fn parse(candidate: &str) -> Option<Self> {
        let rest = candidate.strip_prefix("acct:")?;
        let (user, host) = rest.split_once('@')?;
        if user.is_empty() || host.is_empty() || host.contains('@') || host.contains('/') {
            return None;
        }
        Some(Self {
            user: user.to_string(),
            host: host.to_string(),
        })
    }
}

impl std::fmt::Display for AcctUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "acct:{}@{}", self.user, self.host)
    }
}

/// Validate an absolute http or https URL with a host
pub fn http_https_uri(candidate: &str) -> Option<Url> {
    let url = Url::parse(candidate.trim()).ok()?;
    match url.scheme() {
        "http" | "https" if url.host_str().map(|h| !h.is_empty()).unwrap_or(false) => Some(url),
        _ => None,
    }
}

/// Validate an http or https URL that has no path, query or fragment
pub fn http_https_root_uri(candidate: &str) -> Option<Url> {
    let url = http_https_uri(candidate)?;
    if (url.path().is_empty() || url.path() == "/") && url.query().is_none() && url.fragment().is_none() {
        Some(url)
    } else {
        None
    }
}

/// Validate an acct, http or https URI
pub fn http_https_acct_uri(candidate: &str) -> Option<String> {
    let candidate = candidate.trim();
    if AcctUri::parse(candidate).is_some() || http_https_uri(candidate).is_some() {
        Some(candidate.to_string())
    } else {
        None
    }
}

/// Validate a DNS hostname (no trailing period)
pub fn hostname(candidate: &str) -> Option<String> {
    let candidate = candidate.trim();
    if candidate.is_empty() || candidate.len() > 255 {
        return None;
    }
    let valid_label = |label: &str| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    };
    if candidate.split('.').all(valid_label) {
        Some(candidate.to_string())
    } else {
        None
    }
}

/// Interpret an operator's answer to a yes/no question; an empty answer means yes
pub fn boolean_response(candidate: &str) -> Option<bool> {
    let lower = candidate.trim().to_lowercase();
    if lower.is_empty() {
        return Some(true);
    }
    match lower.as_str() {
        "y" | "yes" | "t" | "true" | "1" => Some(true),
        "n" | "no" | "f" | "false" | "0" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("acct:joe@example.com" => true)]
    #[test_case("acct:@example.com" => false)]
    #[test_case("acct:joe@" => false)]
    #[test_case("joe@example.com" => false)]
    #[test_case("acct:joe@a@b" => false)]
    fn test_acct(candidate: &str) -> bool {
        AcctUri::parse(candidate).is_some()
    }

    #[test_case("https://example.com/users/joe" => true)]
    #[test_case("http://localhost:8080" => true)]
    #[test_case("ftp://example.com" => false)]
    #[test_case("not a url" => false)]
    fn test_http_https(candidate: &str) -> bool {
        http_https_uri(candidate).is_some()
    }

    #[test_case("https://example.com" => true)]
    #[test_case("https://example.com/" => true)]
    #[test_case("https://example.com/path" => false)]
    #[test_case("https://example.com/?q=1" => false)]
    fn test_root_uri(candidate: &str) -> bool {
        http_https_root_uri(candidate).is_some()
    }

    #[test_case("example.com" => true)]
    #[test_case("mastodon-1.1234.lan" => true)]
    #[test_case("-bad.example" => false)]
    #[test_case("example.com." => false)]
    #[test_case("under_score.example" => false)]
    fn test_hostname(candidate: &str) -> bool {
        hostname(candidate).is_some()
    }

    #[test_case("" => Some(true))]
    #[test_case("Yes" => Some(true))]
    #[test_case(" n " => Some(false))]
    #[test_case("0" => Some(false))]
    #[test_case("maybe" => None)]
    fn test_boolean_response(candidate: &str) -> Option<bool> {
        boolean_response(candidate)
    }
}
