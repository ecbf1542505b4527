//! Keystone v3 password authentication and service catalog lookup.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};

use super::OpenStackError;
use crate::config::OpenStackConfig;

/// Header carrying the issued token in Keystone responses.
pub(super) const SUBJECT_TOKEN_HEADER: &str = "X-Subject-Token";

/// Catalog types accepted for the block storage service, in preference
/// order.
const VOLUME_SERVICE_TYPES: [&str; 3] = ["volumev3", "block-storage", "volumev2"];

/// Services the backend talks to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum Service {
    Compute,
    Volume,
    Image,
    Network,
}

impl Service {
    const fn catalog_types(self) -> &'static [&'static str] {
        match self {
            Self::Compute => &["compute"],
            Self::Volume => &VOLUME_SERVICE_TYPES,
            Self::Image => &["image"],
            Self::Network => &["network"],
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    token: Token,
}

#[derive(Debug, Deserialize)]
struct Token {
    expires_at: DateTime<Utc>,
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

#[derive(Clone, Debug, Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<Endpoint>,
}

#[derive(Clone, Debug, Deserialize)]
struct Endpoint {
    interface: String,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    region_id: Option<String>,
    url: String,
}

impl Endpoint {
    fn in_region(&self, region: Option<&str>) -> bool {
        region.is_none_or(|wanted| {
            self.region.as_deref() == Some(wanted) || self.region_id.as_deref() == Some(wanted)
        })
    }
}

/// Base URLs of every service, trimmed of trailing slashes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(super) struct Endpoints {
    compute: String,
    volume: String,
    image: String,
    network: String,
}

impl Endpoints {
    /// Joins `path` onto the base URL of `service`.
    pub(super) fn url(&self, service: Service, path: &str) -> String {
        let base = match service {
            Service::Compute => &self.compute,
            Service::Volume => &self.volume,
            Service::Image => &self.image,
            Service::Network => &self.network,
        };
        format!("{base}{path}")
    }
}

/// A scoped token and the endpoints it is valid for.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(super) struct AuthSession {
    pub(super) token: String,
    pub(super) expires_at: DateTime<Utc>,
    pub(super) endpoints: Endpoints,
}

impl AuthSession {
    /// Returns `true` when the token expires within `margin`.
    pub(super) fn expires_within(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        self.expires_at - now <= margin
    }
}

/// URL of the Keystone token endpoint for `auth_url`, accepting URLs with
/// or without the `/v3` suffix.
pub(super) fn tokens_url(auth_url: &str) -> String {
    let base = auth_url.trim_end_matches('/');
    if base.ends_with("/v3") {
        format!("{base}/auth/tokens")
    } else {
        format!("{base}/v3/auth/tokens")
    }
}

/// Project-scoped password authentication request.
pub(super) fn password_request(config: &OpenStackConfig) -> Value {
    json!({
        "auth": {
            "identity": {
                "methods": ["password"],
                "password": {
                    "user": {
                        "name": config.username,
                        "domain": { "name": config.user_domain_name },
                        "password": config.password,
                    }
                }
            },
            "scope": {
                "project": {
                    "name": config.project_name,
                    "domain": { "name": config.project_domain_name },
                }
            }
        }
    })
}

/// Builds a session from the issued token and the token response body.
pub(super) fn session_from_response(
    token: String,
    body: &str,
    interface: &str,
    region: Option<&str>,
) -> Result<AuthSession, OpenStackError> {
    let parsed: TokenBody = serde_json::from_str(body).map_err(|err| OpenStackError::Decode {
        action: String::from("authenticate"),
        message: err.to_string(),
    })?;
    let catalog = parsed.token.catalog;
    let lookup = |service: Service| {
        endpoint_for(&catalog, service, interface, region).ok_or_else(|| {
            OpenStackError::MissingEndpoint {
                service: service.catalog_types().join("/"),
            }
        })
    };
    Ok(AuthSession {
        token,
        expires_at: parsed.token.expires_at,
        endpoints: Endpoints {
            compute: lookup(Service::Compute)?,
            volume: lookup(Service::Volume)?,
            image: lookup(Service::Image)?,
            network: lookup(Service::Network)?,
        },
    })
}

fn endpoint_for(
    catalog: &[CatalogEntry],
    service: Service,
    interface: &str,
    region: Option<&str>,
) -> Option<String> {
    service.catalog_types().iter().find_map(|wanted| {
        catalog
            .iter()
            .filter(|entry| entry.service_type == *wanted)
            .flat_map(|entry| entry.endpoints.iter())
            .find(|endpoint| endpoint.interface == interface && endpoint.in_region(region))
            .map(|endpoint| endpoint.url.trim_end_matches('/').to_owned())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    const TOKEN_BODY: &str = r#"{
      "token": {
        "expires_at": "2030-01-01T12:00:00.000000Z",
        "catalog": [
          {"type": "compute", "endpoints": [
            {"interface": "internal", "region": "RegionOne", "url": "http://nova.internal/v2.1"},
            {"interface": "public", "region": "RegionOne", "url": "https://nova.example/v2.1/"},
            {"interface": "public", "region": "RegionTwo", "url": "https://nova.two/v2.1"}
          ]},
          {"type": "block-storage", "endpoints": [
            {"interface": "public", "region": "RegionOne", "url": "https://cinder.example/v3/p1"}
          ]},
          {"type": "image", "endpoints": [
            {"interface": "public", "region_id": "RegionOne", "url": "https://glance.example"}
          ]},
          {"type": "network", "endpoints": [
            {"interface": "public", "region": "RegionOne", "url": "https://neutron.example"}
          ]}
        ]
      }
    }"#;

    #[fixture]
    fn config() -> OpenStackConfig {
        OpenStackConfig {
            auth_url: String::from("https://keystone.example:5000/v3/"),
            username: String::from("taster"),
            password: String::from("secret"),
            project_name: String::from("images"),
            user_domain_name: String::from("Default"),
            project_domain_name: String::from("Default"),
            region_name: None,
            interface: String::from("public"),
        }
    }

    #[rstest]
    #[case("https://keystone.example:5000/v3/", "https://keystone.example:5000/v3/auth/tokens")]
    #[case("https://keystone.example:5000", "https://keystone.example:5000/v3/auth/tokens")]
    fn tokens_url_accepts_versioned_and_bare_urls(#[case] auth_url: &str, #[case] expected: &str) {
        assert_eq!(tokens_url(auth_url), expected);
    }

    #[rstest]
    fn password_request_is_project_scoped(config: OpenStackConfig) {
        let body = password_request(&config);

        assert_eq!(
            body.pointer("/auth/identity/password/user/name"),
            Some(&json!("taster"))
        );
        assert_eq!(
            body.pointer("/auth/scope/project/name"),
            Some(&json!("images"))
        );
        assert_eq!(
            body.pointer("/auth/scope/project/domain/name"),
            Some(&json!("Default"))
        );
    }

    #[rstest]
    fn catalog_resolves_public_endpoints() {
        let session = session_from_response(String::from("tok"), TOKEN_BODY, "public", None)
            .expect("session");

        assert_eq!(
            session.endpoints.url(Service::Compute, "/servers"),
            "https://nova.example/v2.1/servers"
        );
        assert_eq!(
            session.endpoints.url(Service::Volume, "/volumes/detail"),
            "https://cinder.example/v3/p1/volumes/detail"
        );
        assert_eq!(session.token, "tok");
    }

    #[rstest]
    fn region_filter_selects_matching_endpoint() {
        let session =
            session_from_response(String::from("tok"), TOKEN_BODY, "public", Some("RegionTwo"));

        assert!(matches!(
            session,
            Err(OpenStackError::MissingEndpoint { ref service }) if service == "volumev3/block-storage/volumev2"
        ));
    }

    #[rstest]
    fn region_id_matches_when_region_is_absent() {
        let session =
            session_from_response(String::from("tok"), TOKEN_BODY, "public", Some("RegionOne"))
                .expect("session");

        assert_eq!(
            session.endpoints.url(Service::Image, "/v2/images"),
            "https://glance.example/v2/images"
        );
    }

    #[rstest]
    fn expiry_margin_triggers_refresh() {
        let session = session_from_response(String::from("tok"), TOKEN_BODY, "public", None)
            .expect("session");
        let margin = chrono::Duration::seconds(60);

        assert!(!session.expires_within(session.expires_at - chrono::Duration::seconds(120), margin));
        assert!(session.expires_within(session.expires_at - chrono::Duration::seconds(30), margin));
    }

    #[rstest]
    fn malformed_token_body_is_a_decode_error() {
        let err = session_from_response(String::from("tok"), "{}", "public", None)
            .expect_err("invalid body");

        assert!(matches!(err, OpenStackError::Decode { .. }));
    }
}
