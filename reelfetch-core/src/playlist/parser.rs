use std::collections::HashMap;

use url::Url;

use crate::error::DownloadError;
use crate::types::{Fragment, FragmentKey, Level, LevelKind};

pub fn is_master(text: &str) -> bool {
    text.contains("#EXT-X-STREAM-INF")
}

pub fn is_media(text: &str) -> bool {
    text.contains("#EXTINF")
}

/// Parse a `#EXT-X-STREAM-INF` / `#EXT-X-MEDIA:TYPE=AUDIO` master playlist
/// into its variant levels, resolving URIs against `base_url`.
pub fn parse_master(text: &str, base_url: &str) -> Result<Vec<Level>, DownloadError> {
    let mut levels = Vec::new();
    let lines: Vec<&str> = text.lines().collect();
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i].trim();
        if let Some(rest) = line.strip_prefix("#EXT-X-STREAM-INF:") {
            let attrs = parse_attributes(rest);
            let uri = lines[i + 1..]
                .iter()
                .map(|l| l.trim())
                .find(|l| !l.is_empty() && !l.starts_with('#'));
            if let Some(uri) = uri {
                levels.push(Level {
                    kind: LevelKind::Stream,
                    uri: resolve_url(base_url, uri)?,
                    bitrate: attrs.get("BANDWIDTH").and_then(|v| v.parse().ok()),
                    width: attrs
                        .get("RESOLUTION")
                        .and_then(|v| v.split_once('x'))
                        .and_then(|(w, _)| w.parse().ok()),
                    height: attrs
                        .get("RESOLUTION")
                        .and_then(|v| v.split_once('x'))
                        .and_then(|(_, h)| h.parse().ok()),
                    fps: attrs.get("FRAME-RATE").and_then(|v| v.parse().ok()),
                    codecs: attrs.get("CODECS").cloned(),
                });
            }
        } else if let Some(rest) = line.strip_prefix("#EXT-X-MEDIA:") {
            let attrs = parse_attributes(rest);
            if attrs.get("TYPE").map(|t| t.as_str()) == Some("AUDIO") {
                if let Some(uri) = attrs.get("URI") {
                    levels.push(Level {
                        kind: LevelKind::Audio,
                        uri: resolve_url(base_url, uri)?,
                        bitrate: None,
                        width: None,
                        height: None,
                        fps: None,
                        codecs: attrs.get("CODECS").cloned(),
                    });
                }
            }
        }
        i += 1;
    }
    Ok(levels)
}

/// Parse an `#EXTINF` media playlist into its ordered fragment list,
/// threading `#EXT-X-KEY` state and emitting `#EXT-X-MAP` init segments.
pub fn parse_media(text: &str, base_url: &str) -> Result<Vec<Fragment>, DownloadError> {
    let mut fragments = Vec::new();
    let mut current_key: Option<FragmentKey> = None;
    let mut current_map_uri: Option<String> = None;
    let mut pending_extinf = false;
    let mut index = 0usize;

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("#EXT-X-KEY:") {
            let attrs = parse_attributes(rest);
            current_key = match attrs.get("METHOD").map(|m| m.as_str()) {
                Some("NONE") | None => None,
                Some(_) => Some(FragmentKey {
                    uri: attrs.get("URI").cloned(),
                    iv: attrs.get("IV").cloned(),
                }),
            };
            continue;
        }
        if let Some(rest) = line.strip_prefix("#EXT-X-MAP:") {
            let attrs = parse_attributes(rest);
            let map_uri = attrs.get("URI").cloned();
            if map_uri != current_map_uri && map_uri.is_some() {
                let uri = map_uri.clone().unwrap();
                fragments.push(Fragment {
                    index,
                    uri: resolve_url(base_url, &uri)?,
                    key: current_key.clone(),
                });
                index += 1;
            }
            current_map_uri = map_uri;
            continue;
        }
        if line.starts_with("#EXTINF") {
            pending_extinf = true;
            continue;
        }
        if line.starts_with('#') {
            continue;
        }
        if pending_extinf {
            fragments.push(Fragment {
                index,
                uri: resolve_url(base_url, line)?,
                key: current_key.clone(),
            });
            index += 1;
            pending_extinf = false;
        }
    }

    Ok(fragments)
}

/// True iff `candidate_media_url`, after URL normalization, names one of
/// the variant URIs declared in `master_text`.
pub fn belongs_to_master(
    master_text: &str,
    master_url: &str,
    candidate_media_url: &str,
) -> Result<bool, DownloadError> {
    let levels = parse_master(master_text, master_url)?;
    let candidate = normalize_url(candidate_media_url)?;
    Ok(levels
        .iter()
        .any(|level| normalize_url(&level.uri).map(|u| u == candidate).unwrap_or(false)))
}

fn normalize_url(raw: &str) -> Result<String, DownloadError> {
    Url::parse(raw)
        .map(|u| u.to_string())
        .map_err(|err| DownloadError::Fetch {
            uri: raw.to_string(),
            cause: err.to_string(),
        })
}

fn resolve_url(base: &str, candidate: &str) -> Result<String, DownloadError> {
    if let Ok(parsed) = Url::parse(candidate) {
        if matches!(parsed.scheme(), "http" | "https" | "file") {
            return Ok(candidate.to_string());
        }
    }
    let base = Url::parse(base).map_err(|err| DownloadError::Fetch {
        uri: base.to_string(),
        cause: err.to_string(),
    })?;
    let joined = base.join(candidate).map_err(|err| DownloadError::Fetch {
        uri: candidate.to_string(),
        cause: err.to_string(),
    })?;
    Ok(joined.to_string())
}

/// Parse a CSV attribute list (`KEY=value,KEY="quoted value"`) as found
/// after the colon in `#EXT-X-*` tags.
fn parse_attributes(rest: &str) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    let mut chars = rest.chars().peekable();
    loop {
        let key: String = chars
            .by_ref()
            .take_while(|&c| c != '=')
            .collect::<String>()
            .trim()
            .to_string();
        if key.is_empty() {
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
            // consume trailing comma if present
            if chars.peek() == Some(&',') {
                chars.next();
            }
        } else {
            for c in chars.by_ref() {
                if c == ',' {
                    break;
                }
                value.push(c);
            }
        }
        attrs.insert(key, value.trim().to_string());
        if rest.is_empty() {
            break;
        }
    }
    attrs
}
