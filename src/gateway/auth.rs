use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::collections::BTreeMap;

/// Decides who may talk to a hosted repository.
pub trait AuthPolicy: Send + Sync {
    fn authenticate(&self, repository: &str, user: &str, password: &str) -> bool;

    /// Realm announced in `WWW-Authenticate`.
    fn realm(&self, repository: &str) -> String {
        repository.to_string()
    }
}

/// Fixed user to password table, typically from `[server.credentials]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticCredentials {
    credentials: BTreeMap<String, String>,
}

impl StaticCredentials {
    pub fn new(credentials: BTreeMap<String, String>) -> Self {
        StaticCredentials { credentials }
    }
}

impl AuthPolicy for StaticCredentials {
    fn authenticate(&self, _repository: &str, user: &str, password: &str) -> bool {
        self.credentials
            .get(user)
            .is_some_and(|expected| expected == password)
    }
}

/// User and password of a `Basic` authorization header value.
pub fn parse_basic(header: &str) -> Option<(String, String)> {
    let (scheme, encoded) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }

    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_credentials_are_decoded() {
        let header = format!("Basic {}", STANDARD.encode("alice:s3:cret"));
        assert_eq!(
            parse_basic(&header),
            Some(("alice".to_string(), "s3:cret".to_string()))
        );
        assert_eq!(parse_basic("basic !!!"), None);
        assert_eq!(parse_basic("Bearer abc"), None);
    }

    #[test]
    fn static_credentials_match_exactly() {
        let policy = StaticCredentials::new(BTreeMap::from([("alice".to_string(), "secret".to_string())]));

        assert!(policy.authenticate("wiki", "alice", "secret"));
        assert!(!policy.authenticate("wiki", "alice", "Secret"));
        assert!(!policy.authenticate("wiki", "bob", "secret"));
        assert_eq!(policy.realm("wiki"), "wiki");
    }
}
