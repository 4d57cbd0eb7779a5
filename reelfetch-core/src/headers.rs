use std::collections::HashMap;
use std::sync::Mutex;

use tracing::warn;
use url::Url;

/// Installs/uninstalls per-download request header rules for CDNs that
/// require `Origin`/`Referer` matching the originating page. Absence of a
/// backing facility is non-fatal; this is the in-process default.
pub trait HeaderRuleFacility: Send + Sync {
    /// Derives two rule ids (Origin, Referer) deterministically from
    /// `download_id`, scoped to `cdn_url`'s host + directory.
    fn add(&self, download_id: &str, cdn_url: &str, page_url: &str) -> Vec<i32>;

    /// Idempotent; must be invoked even on failure paths.
    fn remove(&self, rule_ids: &[i32]);
}

#[derive(Debug, Clone)]
struct HeaderRule {
    url_filter: String,
    origin: String,
    referer: String,
}

/// In-memory facility; a process-external equivalent (e.g. a browser
/// extension's `declarativeNetRequest` API) would implement the same trait.
#[derive(Default)]
pub struct InMemoryHeaderRules {
    rules: Mutex<HashMap<i32, HeaderRule>>,
}

impl InMemoryHeaderRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.lock().unwrap().len()
    }

    pub fn headers_for(&self, url_filter: &str) -> Option<(String, String)> {
        self.rules
            .lock()
            .unwrap()
            .values()
            .find(|rule| rule.url_filter == url_filter)
            .map(|rule| (rule.origin.clone(), rule.referer.clone()))
    }
}

impl HeaderRuleFacility for InMemoryHeaderRules {
    fn add(&self, download_id: &str, cdn_url: &str, page_url: &str) -> Vec<i32> {
        let origin_id = derive_rule_id(download_id, 0);
        let referer_id = derive_rule_id(download_id, 1);

        let url_filter = match Url::parse(cdn_url) {
            Ok(parsed) => scope_filter(&parsed),
            Err(err) => {
                warn!(download_id, cdn_url, %err, "failed to install header rules, skipping");
                return Vec::new();
            }
        };
        let referer = page_url.to_string();
        let origin = Url::parse(page_url)
            .map(|u| format!("{}://{}", u.scheme(), u.host_str().unwrap_or_default()))
            .unwrap_or_else(|_| page_url.to_string());

        let mut rules = self.rules.lock().unwrap();
        rules.insert(
            origin_id,
            HeaderRule {
                url_filter: url_filter.clone(),
                origin: origin.clone(),
                referer: referer.clone(),
            },
        );
        rules.insert(
            referer_id,
            HeaderRule {
                url_filter,
                origin,
                referer,
            },
        );
        vec![origin_id, referer_id]
    }

    fn remove(&self, rule_ids: &[i32]) {
        let mut rules = self.rules.lock().unwrap();
        for id in rule_ids {
            rules.remove(id);
        }
    }
}

/// Two consecutive ids derived from `download_id`'s hash, kept in the
/// positive 31-bit range expected by header-rule engines.
fn derive_rule_id(download_id: &str, slot: i32) -> i32 {
    let mut hash: u32 = 2166136261;
    for byte in download_id.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    ((hash & 0x7FFF_FFFE) as i32).wrapping_add(slot)
}

fn scope_filter(url: &Url) -> String {
    let path = url.path();
    let dir = path.rsplit_once('/').map(|(d, _)| d).unwrap_or("");
    format!("{}://{}{}/*", url.scheme(), url.host_str().unwrap_or_default(), dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_remove_is_idempotent() {
        let facility = InMemoryHeaderRules::new();
        let ids = facility.add("dl1", "https://cdn.example/video/seg0.ts", "https://site.example/watch");
        assert_eq!(ids.len(), 2);
        assert_eq!(facility.rule_count(), 2);
        facility.remove(&ids);
        assert_eq!(facility.rule_count(), 0);
        facility.remove(&ids);
        assert_eq!(facility.rule_count(), 0);
    }

    #[test]
    fn rule_ids_are_deterministic_per_download() {
        let facility = InMemoryHeaderRules::new();
        let first = facility.add("dl1", "https://cdn.example/a.ts", "https://site.example");
        facility.remove(&first);
        let second = facility.add("dl1", "https://cdn.example/a.ts", "https://site.example");
        assert_eq!(first, second);
    }

    #[test]
    fn invalid_cdn_url_is_non_fatal() {
        let facility = InMemoryHeaderRules::new();
        let ids = facility.add("dl1", "not a url", "https://site.example");
        assert!(ids.is_empty());
    }
}
