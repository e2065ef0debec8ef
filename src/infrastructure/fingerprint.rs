//! Browser fingerprint pool for session de-correlation
//!
//! The portal ties rate limits and cookies to session identity, so each
//! concurrent worker presents a different browser identity. A fingerprint is
//! a named header set; rotation picks a fresh one excluding the identity the
//! failing session was using.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// A simulated browser identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserFingerprint {
    /// Short unique name, e.g. "chrome-win"
    pub name: String,
    pub user_agent: String,
    pub accept: String,
    pub accept_language: String,
    /// Sec-CH-UA platform hint; empty for browsers that do not send it
    pub sec_ch_ua_platform: String,
}

static DEFAULT_FINGERPRINTS: Lazy<Vec<BrowserFingerprint>> = Lazy::new(|| {
    let html_accept =
        "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8";
    vec![
        BrowserFingerprint {
            name: "chrome-win".to_string(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36"
                .to_string(),
            accept: html_accept.to_string(),
            accept_language: "th-TH,th;q=0.9,en-US;q=0.8,en;q=0.7".to_string(),
            sec_ch_ua_platform: "\"Windows\"".to_string(),
        },
        BrowserFingerprint {
            name: "chrome-mac".to_string(),
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36"
                .to_string(),
            accept: html_accept.to_string(),
            accept_language: "th-TH,th;q=0.9,en;q=0.8".to_string(),
            sec_ch_ua_platform: "\"macOS\"".to_string(),
        },
        BrowserFingerprint {
            name: "firefox-win".to_string(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 \
                         Firefox/125.0"
                .to_string(),
            accept: "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".to_string(),
            accept_language: "th,en-US;q=0.7,en;q=0.3".to_string(),
            sec_ch_ua_platform: String::new(),
        },
        BrowserFingerprint {
            name: "edge-win".to_string(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.0.0"
                .to_string(),
            accept: html_accept.to_string(),
            accept_language: "th-TH,th;q=0.9,en-US;q=0.8,en;q=0.7".to_string(),
            sec_ch_ua_platform: "\"Windows\"".to_string(),
        },
        BrowserFingerprint {
            name: "safari-mac".to_string(),
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 \
                         (KHTML, like Gecko) Version/17.4 Safari/605.1.15"
                .to_string(),
            accept: "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".to_string(),
            accept_language: "th-TH,th;q=0.9".to_string(),
            sec_ch_ua_platform: String::new(),
        },
        BrowserFingerprint {
            name: "firefox-linux".to_string(),
            user_agent: "Mozilla/5.0 (X11; Linux x86_64; rv:124.0) Gecko/20100101 Firefox/124.0"
                .to_string(),
            accept: "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".to_string(),
            accept_language: "en-US,en;q=0.5".to_string(),
            sec_ch_ua_platform: String::new(),
        },
    ]
});

/// Pool of browser identities handed out to worker sessions.
#[derive(Debug, Clone)]
pub struct FingerprintPool {
    fingerprints: Vec<BrowserFingerprint>,
}

impl FingerprintPool {
    pub fn new() -> Self {
        Self {
            fingerprints: DEFAULT_FINGERPRINTS.clone(),
        }
    }

    pub fn with_fingerprints(fingerprints: Vec<BrowserFingerprint>) -> Self {
        assert!(!fingerprints.is_empty(), "fingerprint pool cannot be empty");
        Self { fingerprints }
    }

    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }

    /// All fingerprints in random order. Callers assigning more workers than
    /// there are identities wrap around the returned list.
    pub fn shuffled(&self) -> Vec<BrowserFingerprint> {
        let mut shuffled = self.fingerprints.clone();
        for i in (1..shuffled.len()).rev() {
            shuffled.swap(i, fastrand::usize(..=i));
        }
        shuffled
    }

    /// A random fingerprint different from the given name, for rotating a
    /// flagged session onto a fresh identity.
    pub fn pick_excluding(&self, excluded_name: &str) -> BrowserFingerprint {
        let others: Vec<&BrowserFingerprint> = self
            .fingerprints
            .iter()
            .filter(|f| f.name != excluded_name)
            .collect();
        if others.is_empty() {
            // Single-entry pool; nothing else to hand out.
            return self.fingerprints[0].clone();
        }
        others[fastrand::usize(..others.len())].clone()
    }
}

impl Default for FingerprintPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shuffled_returns_every_identity_once() {
        let pool = FingerprintPool::new();
        let shuffled = pool.shuffled();
        assert_eq!(shuffled.len(), pool.len());

        let mut names: Vec<&str> = shuffled.iter().map(|f| f.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), pool.len());
    }

    #[test]
    fn pick_excluding_never_returns_the_excluded_identity() {
        let pool = FingerprintPool::new();
        for _ in 0..50 {
            let picked = pool.pick_excluding("chrome-win");
            assert_ne!(picked.name, "chrome-win");
        }
    }

    #[test]
    fn single_entry_pool_falls_back_to_itself() {
        let only = BrowserFingerprint {
            name: "solo".to_string(),
            user_agent: "test-agent".to_string(),
            accept: "*/*".to_string(),
            accept_language: "en".to_string(),
            sec_ch_ua_platform: String::new(),
        };
        let pool = FingerprintPool::with_fingerprints(vec![only.clone()]);
        assert_eq!(pool.pick_excluding("solo"), only);
    }
}
