//! Reference grammar and repository/tag validation (spec.md §3, §6).

/// A name inside a [`super::store::Repository`]: either a tag or a digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Reference {
    Tag(String),
    Digest(String),
}

impl Reference {
    pub fn as_str(&self) -> &str {
        match self {
            Reference::Tag(t) => t,
            Reference::Digest(d) => d,
        }
    }

    pub fn is_digest(&self) -> bool {
        matches!(self, Reference::Digest(_))
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const DEFAULT_REFERENCE: &str = "latest";

/// `[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}` (spec.md §6).
pub fn is_valid_tag(tag: &str) -> bool {
    let mut chars = tag.chars();
    let Some(first) = chars.next() else { return false };
    if !(first.is_ascii_alphanumeric() || first == '_') {
        return false;
    }
    if tag.len() > 128 {
        return false;
    }
    tag.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// `<alg>:<hex>` where alg is `sha256` or `tarsum+v1+sha256` (spec.md §6).
pub fn is_valid_digest(digest: &str) -> bool {
    crate::digest::Digest::parse(digest).is_some()
}

/// Repository names are validated only for non-emptiness (spec.md §6);
/// slashes and colons belong to the reference, not the repository.
pub fn is_valid_repository(name: &str) -> bool {
    !name.is_empty()
}

/// Splits `name` into `(repository, reference)`. A trailing `@<digest>`
/// always wins over a trailing `:<tag>`; when neither is present the
/// default reference (`latest`) is used (spec.md §3 "TagStore state").
pub fn parse_name(name: &str) -> (String, Reference) {
    if let Some((repo, digest)) = name.split_once('@') {
        return (repo.to_string(), Reference::Digest(digest.to_string()));
    }
    // A colon after the last '/' separates repo from tag; a colon before
    // it is part of a registry host:port and belongs to the repository.
    let last_slash = name.rfind('/').map(|i| i + 1).unwrap_or(0);
    if let Some(colon) = name[last_slash..].rfind(':') {
        let split_at = last_slash + colon;
        return (name[..split_at].to_string(), Reference::Tag(name[split_at + 1..].to_string()));
    }
    (name.to_string(), Reference::Tag(DEFAULT_REFERENCE.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_tag() {
        assert!(is_valid_tag("latest"));
        assert!(is_valid_tag("1.0.0-alpine"));
        assert!(is_valid_tag("_underscore"));
    }

    #[test]
    fn rejects_leading_dot_or_dash() {
        assert!(!is_valid_tag(".hidden"));
        assert!(!is_valid_tag("-flag"));
    }

    #[test]
    fn rejects_slash_or_colon() {
        assert!(!is_valid_tag("a/b"));
        assert!(!is_valid_tag("a:b"));
    }

    #[test]
    fn rejects_overlong_tag() {
        let tag = "a".repeat(129);
        assert!(!is_valid_tag(&tag));
    }

    #[test]
    fn parses_bare_repository_to_default_reference() {
        let (repo, reference) = parse_name("busybox");
        assert_eq!(repo, "busybox");
        assert_eq!(reference, Reference::Tag("latest".to_string()));
    }

    #[test]
    fn parses_tagged_repository() {
        let (repo, reference) = parse_name("busybox:1.0");
        assert_eq!(repo, "busybox");
        assert_eq!(reference, Reference::Tag("1.0".to_string()));
    }

    #[test]
    fn parses_host_with_port_and_no_tag() {
        let (repo, reference) = parse_name("localhost:5000/busybox");
        assert_eq!(repo, "localhost:5000/busybox");
        assert_eq!(reference, Reference::Tag("latest".to_string()));
    }

    #[test]
    fn parses_digest_reference() {
        let digest = format!("sha256:{}", "a".repeat(64));
        let (repo, reference) = parse_name(&format!("busybox@{digest}"));
        assert_eq!(repo, "busybox");
        assert_eq!(reference, Reference::Digest(digest));
    }
}
