use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    YouTube,
    Facebook,
    Instagram,
    Twitter,
}

/// Host whitelist. A host matches an entry when it equals the domain or is a
/// subdomain of it.
const HOSTS: &[(&str, Platform)] = &[
    ("youtube.com", Platform::YouTube),
    ("youtu.be", Platform::YouTube),
    ("facebook.com", Platform::Facebook),
    ("fb.watch", Platform::Facebook),
    ("instagram.com", Platform::Instagram),
    ("x.com", Platform::Twitter),
    ("twitter.com", Platform::Twitter),
];

impl Platform {
    pub fn from_host(host: &str) -> Option<Self> {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        HOSTS
            .iter()
            .find(|(domain, _)| {
                host == *domain
                    || host
                        .strip_suffix(domain)
                        .map(|prefix| prefix.ends_with('.'))
                        .unwrap_or(false)
            })
            .map(|(_, platform)| *platform)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Platform::YouTube => "youtube",
            Platform::Facebook => "facebook",
            Platform::Instagram => "instagram",
            Platform::Twitter => "twitter",
        }
    }

    pub fn extractor_args(&self) -> &'static [&'static str] {
        match self {
            Platform::Facebook => &["--extractor-args", "facebook:api_version=v12.0"],
            _ => &[],
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
