//! Test-owned identities and their discovery documents

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use url::Url;

pub const ACTIVITY_JSON: &str = "application/activity+json";
pub const JRD_JSON: &str = "application/jrd+json";

/// An actor the listener publishes on behalf of one test run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestIdentity {
    /// Local name, unique within the listener
    pub name: String,
    pub run_id: String,
    pub actor_uri: String,
    pub inbox_uri: String,
    /// `acct:name@authority` used for WebFinger
    pub acct: String,
}

impl TestIdentity {
    pub fn new(name: impl Into<String>, run_id: impl Into<String>, base_url: &Url) -> Self {
        let name = name.into();
        let base = base_url.as_str().trim_end_matches('/');
        let actor_uri = format!("{}/actors/{}", base, name);
        let inbox_uri = format!("{}/inbox", actor_uri);
        let acct = format!("acct:{}@{}", name, authority(base_url));

        Self {
            name,
            run_id: run_id.into(),
            actor_uri,
            inbox_uri,
            acct,
        }
    }

    /// Minimal ActivityStreams actor document
    pub fn actor_document(&self) -> Value {
        json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": self.actor_uri,
            "type": "Application",
            "preferredUsername": self.name,
            "inbox": self.inbox_uri,
        })
    }

    /// WebFinger resource descriptor
    pub fn jrd(&self) -> Value {
        json!({
            "subject": self.acct,
            "aliases": [self.actor_uri],
            "links": [
                {
                    "rel": "self",
                    "type": ACTIVITY_JSON,
                    "href": self.actor_uri,
                }
            ],
        })
    }

    /// Whether a WebFinger `resource` names this identity
    pub fn answers_to(&self, resource: &str) -> bool {
        resource == self.acct || resource == self.actor_uri
    }
}

/// host[:port] of a base URL
pub fn authority(url: &Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{}:{}", host, port),
        (Some(host), None) => host.to_string(),
        _ => String::new(),
    }
}
