use regex::Regex;
use std::sync::OnceLock;

use crate::error::DownloadError;

fn drm_patterns() -> &'static [Regex; 4] {
    static PATTERNS: OnceLock<[Regex; 4]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            Regex::new(r#"#EXT-X-(SESSION-)?KEY:[^\n]*URI="skd://"#).unwrap(),
            Regex::new(
                r#"#EXT-X-(SESSION-)?KEY:[^\n]*KEYFORMAT="com\.apple\.streamingkeydelivery""#,
            )
            .unwrap(),
            Regex::new(r#"#EXT-X-(SESSION-)?KEY:[^\n]*KEYFORMAT="com\.microsoft\.playready""#)
                .unwrap(),
            Regex::new(r"#EXT-X-FAXS-CM:").unwrap(),
        ]
    })
}

fn method_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#"#EXT-X-KEY:[^\n]*METHOD=([A-Za-z0-9_-]+)"#).unwrap())
}

/// True iff `text` references a known DRM scheme (FairPlay, PlayReady
/// streaming key delivery, or Flash Access).
pub fn has_drm(text: &str) -> bool {
    drm_patterns().iter().any(|re| re.is_match(text))
}

/// True unless some `#EXT-X-KEY:METHOD=` value is neither `NONE` nor
/// `AES-128`.
pub fn can_decrypt(text: &str) -> bool {
    method_pattern()
        .captures_iter(text)
        .all(|cap| matches!(&cap[1], "NONE" | "AES-128"))
}

/// Fails with `DrmProtected` if `has_drm`, or `UnsupportedEncryption` if
/// not `can_decrypt`. Invoked on every fetched playlist text.
pub fn assert_downloadable(text: &str) -> Result<(), DownloadError> {
    if has_drm(text) {
        return Err(DownloadError::DrmProtected);
    }
    if !can_decrypt(text) {
        let method = method_pattern()
            .captures_iter(text)
            .map(|cap| cap[1].to_string())
            .find(|m| m != "NONE" && m != "AES-128")
            .unwrap_or_else(|| "unknown".to_string());
        return Err(DownloadError::UnsupportedEncryption(method));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plaintext_playlist_is_downloadable() {
        let text = "#EXTM3U\n#EXTINF:10,\nseg0.ts\n";
        assert!(!has_drm(text));
        assert!(can_decrypt(text));
        assert!(assert_downloadable(text).is_ok());
    }

    #[test]
    fn fairplay_session_key_is_drm_protected() {
        let text = r#"#EXT-X-SESSION-KEY:METHOD=SAMPLE-AES,URI="skd://deadbeef""#;
        assert!(has_drm(text));
        assert!(matches!(
            assert_downloadable(text).unwrap_err(),
            DownloadError::DrmProtected
        ));
    }

    #[test]
    fn playready_keyformat_is_drm_protected() {
        let text = r#"#EXT-X-KEY:METHOD=SAMPLE-AES-CTR,URI="x",KEYFORMAT="com.microsoft.playready""#;
        assert!(has_drm(text));
    }

    #[test]
    fn unsupported_method_without_drm_markers() {
        let text = "#EXT-X-KEY:METHOD=SAMPLE-AES,URI=\"k\"\n";
        assert!(!has_drm(text));
        assert!(!can_decrypt(text));
        assert!(matches!(
            assert_downloadable(text).unwrap_err(),
            DownloadError::UnsupportedEncryption(_)
        ));
    }

    #[test]
    fn aes_128_method_is_decryptable() {
        let text = "#EXT-X-KEY:METHOD=AES-128,URI=\"k\",IV=0x01\n";
        assert!(can_decrypt(text));
        assert!(assert_downloadable(text).is_ok());
    }
}
