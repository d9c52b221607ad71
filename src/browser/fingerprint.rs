use std::collections::BTreeMap;
use anyhow::Result;
use rand::{thread_rng, Rng};
use tracing::debug;
use serde::{Serialize, Deserialize};

use crate::cli::config::BrowserFingerprint;

/// Browser fingerprint generator and manager
#[derive(Debug, Clone)]
pub struct FingerprintManager {
    /// Available fingerprints to use
    fingerprints: Vec<BrowserFingerprint>,
}

/// Viewport dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Client identity used for a single fetch attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub name: String,
    pub user_agent: String,
    pub accept_language: String,
    pub platform: String,
    pub viewport: Viewport,
    pub headers: BTreeMap<String, String>,
}

impl FingerprintManager {
    /// Create a new fingerprint manager with the given fingerprints
    pub fn new(fingerprints: Vec<BrowserFingerprint>) -> Result<Self> {
        if fingerprints.is_empty() {
            anyhow::bail!("No fingerprints available");
        }
        Ok(Self { fingerprints })
    }

    /// Select a random fingerprint and randomize the rest of the identity
    pub fn random_identity(&self) -> ClientIdentity {
        let mut rng = thread_rng();
        let fingerprint = &self.fingerprints[rng.gen_range(0..self.fingerprints.len())];
        self.complete(fingerprint)
    }

    /// Complete a basic fingerprint with a viewport and header set
    fn complete(&self, fingerprint: &BrowserFingerprint) -> ClientIdentity {
        let mut rng = thread_rng();

        let viewport = if fingerprint.user_agent.contains("Mobile") {
            Viewport {
                width: rng.gen_range(320..480),
                height: rng.gen_range(568..812),
            }
        } else {
            Viewport {
                width: rng.gen_range(1024..1920),
                height: rng.gen_range(768..1080),
            }
        };

        let mut headers = BTreeMap::new();
        headers.insert("User-Agent".to_string(), fingerprint.user_agent.clone());
        headers.insert("Accept-Language".to_string(), fingerprint.accept_language.clone());
        headers.insert("Accept".to_string(), "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8".to_string());
        headers.insert("Upgrade-Insecure-Requests".to_string(), "1".to_string());
        // Client hints quote their values
        headers.insert("Sec-CH-UA-Platform".to_string(), format!("\"{}\"", fingerprint.platform));

        // Vary optional headers so consecutive attempts do not look identical
        if rng.gen_bool(0.5) {
            headers.insert("DNT".to_string(), "1".to_string());
        }
        if rng.gen_bool(0.5) {
            headers.insert("Cache-Control".to_string(), "no-cache".to_string());
        }

        for (key, value) in &fingerprint.extra_headers {
            headers.insert(key.clone(), value.clone());
        }

        debug!("Generated identity: {}", fingerprint.name);

        ClientIdentity {
            name: fingerprint.name.clone(),
            user_agent: fingerprint.user_agent.clone(),
            accept_language: fingerprint.accept_language.clone(),
            platform: fingerprint.platform.clone(),
            viewport,
            headers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn fingerprints() -> Vec<BrowserFingerprint> {
        vec![
            BrowserFingerprint {
                name: "desktop".to_string(),
                user_agent: "Mozilla/5.0 (X11; Linux x86_64) Chrome/114.0".to_string(),
                accept_language: "en-US".to_string(),
                platform: "Linux".to_string(),
                extra_headers: HashMap::from([("X-Test".to_string(), "yes".to_string())]),
            },
            BrowserFingerprint {
                name: "phone".to_string(),
                user_agent: "Mozilla/5.0 (iPhone) Mobile Safari".to_string(),
                accept_language: "en-GB".to_string(),
                platform: "iPhone".to_string(),
                extra_headers: HashMap::new(),
            },
        ]
    }

    fn identity(name: &str) -> ClientIdentity {
        let pool = fingerprints();
        let manager = FingerprintManager::new(pool.clone()).unwrap();
        let fingerprint = pool.iter().find(|f| f.name == name).unwrap();
        manager.complete(fingerprint)
    }

    #[test]
    fn test_empty_pool_is_rejected() {
        assert!(FingerprintManager::new(vec![]).is_err());
    }

    #[test]
    fn test_identity_carries_fingerprint_headers() {
        let identity = identity("desktop");

        assert_eq!(identity.headers["User-Agent"], identity.user_agent);
        assert_eq!(identity.headers["X-Test"], "yes");
        assert_eq!(identity.platform, "Linux");
        assert_eq!(identity.headers["Sec-CH-UA-Platform"], "\"Linux\"");
        assert!(identity.viewport.width >= 1024);
    }

    #[test]
    fn test_mobile_identity_gets_small_viewport() {
        let identity = identity("phone");
        assert!(identity.viewport.width < 480);
    }

    #[test]
    fn test_random_identity_comes_from_pool() {
        let manager = FingerprintManager::new(fingerprints()).unwrap();
        for _ in 0..20 {
            let identity = manager.random_identity();
            assert!(identity.name == "desktop" || identity.name == "phone");
        }
    }
}
