//! Hand-rolled format predicates for the validator's format-rules table.
//! No parser-combinator or regex crate is pulled in for this: every check
//! here is a handful of character-class comparisons.

#[must_use]
pub fn is_env_name(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[must_use]
pub fn is_chmod(s: &str) -> bool {
    (3..=4).contains(&s.len()) && s.bytes().all(|b| (b'0'..=b'7').contains(&b))
}

#[must_use]
pub fn is_chown(s: &str) -> bool {
    let mut parts = s.splitn(2, ':');
    let user = parts.next().unwrap_or_default();
    let group = parts.next();
    is_chown_component(user) && group.is_none_or(is_chown_component)
}

fn is_chown_component(s: &str) -> bool {
    if s.is_empty() {
        return false;
    }
    if s.bytes().all(|b| b.is_ascii_digit()) {
        return true;
    }
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

#[must_use]
pub fn is_checksum(s: &str) -> bool {
    let Some((algo, hex)) = s.split_once(':') else { return false };
    let expected_len = match algo {
        "md5" => 32,
        "sha1" => 40,
        "sha256" => 64,
        "sha512" => 128,
        _ => return false,
    };
    hex.len() == expected_len && hex.bytes().all(|b| b.is_ascii_hexdigit())
}

#[must_use]
pub fn is_duration(s: &str) -> bool {
    let Some((digits, unit)) = s.split_at_checked(s.len().saturating_sub(1)) else { return false };
    !digits.is_empty()
        && digits.bytes().all(|b| b.is_ascii_digit())
        && matches!(unit, "s" | "m" | "h")
}

#[must_use]
pub fn is_port(s: &str) -> bool {
    let (num, proto) = match s.split_once('/') {
        Some((n, p)) => (n, Some(p)),
        None => (s, None),
    };
    if !num.bytes().all(|b| b.is_ascii_digit()) || num.is_empty() {
        return false;
    }
    let Ok(port) = num.parse::<u32>() else { return false };
    (1..=65535).contains(&port) && proto.is_none_or(|p| p == "tcp" || p == "udp")
}

const PLATFORM_OS: [&str; 4] = ["linux", "windows", "darwin", "freebsd"];
const PLATFORM_ARCH: [&str; 6] = ["amd64", "arm64", "arm", "386", "ppc64le", "s390x"];

#[must_use]
pub fn is_platform(s: &str) -> bool {
    let mut parts = s.split('/');
    let Some(os) = parts.next() else { return false };
    if !PLATFORM_OS.contains(&os) {
        return false;
    }
    match parts.next() {
        Some(arch) if !PLATFORM_ARCH.contains(&arch) => return false,
        _ => {}
    }
    parts.next(); // variant: unconstrained
    parts.next().is_none()
}

#[must_use]
pub fn is_signal(s: &str) -> bool {
    if let Some(name) = s.strip_prefix("SIG") {
        return !name.is_empty() && name.bytes().all(|b| b.is_ascii_uppercase());
    }
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_names() {
        assert!(is_env_name("FOO_BAR1"));
        assert!(!is_env_name("1FOO"));
    }

    #[test]
    fn chmod_digits() {
        assert!(is_chmod("755"));
        assert!(is_chmod("0755"));
        assert!(!is_chmod("abc"));
    }

    #[test]
    fn chown_forms() {
        assert!(is_chown("1000:1000"));
        assert!(is_chown("app_user:app-group"));
        assert!(!is_chown(":group"));
    }

    #[test]
    fn checksum_lengths() {
        assert!(is_checksum(&format!("sha256:{}", "a".repeat(64))));
        assert!(!is_checksum(&format!("sha256:{}", "a".repeat(63))));
    }

    #[test]
    fn ports() {
        assert!(is_port("8080/tcp"));
        assert!(is_port("53/udp"));
        assert!(is_port("80"));
        assert!(!is_port("70000"));
        assert!(!is_port("0"));
    }

    #[test]
    fn platforms() {
        assert!(is_platform("linux/amd64"));
        assert!(is_platform("linux/arm64/v8"));
        assert!(!is_platform("amiga/m68k"));
    }

    #[test]
    fn signals() {
        assert!(is_signal("SIGTERM"));
        assert!(is_signal("9"));
        assert!(!is_signal("sigterm"));
    }
}
