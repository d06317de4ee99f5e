//! Client protocol version quadruple. The teacher's `WaVersionManager` reached out to
//! web.whatsapp.com over `reqwest` to learn the live version; that HTTP client is not part
//! of this core's dependency stack, so the version is a `Config`-supplied value with this
//! fallback as the default (see DESIGN.md). The string-parsing helpers are kept, since an
//! embedding application may still want to parse a version string it obtained elsewhere
//! (e.g. from a cached `sw.js` fetch it performs itself).

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaWebVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl WaWebVersion {
    pub const fn fallback() -> Self {
        Self {
            major: 2,
            minor: 3000,
            patch: 1033846690,
        }
    }

    pub fn as_tuple(&self) -> (u32, u32, u32) {
        (self.major, self.minor, self.patch)
    }
}

/// Extracts a `client_revision` field (as embedded in web.whatsapp.com's bootstrap HTML or
/// service worker script) without pulling in a full HTML parser or regex engine.
pub fn extract_client_revision(source: &str) -> Option<WaWebVersion> {
    let marker = "client_revision";
    let idx = source.find(marker)?;
    let after = &source[idx + marker.len()..];
    let digits: String = after
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();

    if digits.is_empty() {
        return None;
    }

    let patch = digits.parse::<u32>().ok()?;
    Some(WaWebVersion {
        major: 2,
        minor: 3000,
        patch,
    })
}

/// Extracts a bare `major.minor.patch` semver-shaped triple with a long (6+ digit) patch
/// component, the fallback format used before `client_revision` existed on the page.
pub fn extract_semver_triple(source: &str) -> Option<WaWebVersion> {
    let tokens: Vec<&str> = source
        .split(|c: char| !c.is_ascii_digit() && c != '.')
        .filter(|t| !t.is_empty())
        .collect();

    tokens.into_iter().find_map(|token| {
        let mut parts = token.split('.');
        let major = parts.next()?.parse::<u32>().ok()?;
        let minor = parts.next()?.parse::<u32>().ok()?;
        let patch_str = parts.next()?;
        if parts.next().is_some() || patch_str.len() < 6 {
            return None;
        }
        let patch = patch_str.parse::<u32>().ok()?;
        Some(WaWebVersion { major, minor, patch })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_client_revision() {
        let html = r#"<html><body>{"client_revision":1033846690}</body></html>"#;
        assert_eq!(
            extract_client_revision(html),
            Some(WaWebVersion {
                major: 2,
                minor: 3000,
                patch: 1033846690,
            })
        );
    }

    #[test]
    fn parses_semver_fallback() {
        let html = "window.__WA_VERSION__='2.3000.1031111111';";
        assert_eq!(
            extract_semver_triple(html),
            Some(WaWebVersion {
                major: 2,
                minor: 3000,
                patch: 1031111111,
            })
        );
    }

    #[test]
    fn fallback_is_stable() {
        assert_eq!(WaWebVersion::fallback().as_tuple(), (2, 3000, 1033846690));
    }
}
