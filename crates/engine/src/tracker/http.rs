use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracksync_storage::EntityRef;

use super::{Tracker, TrackerError};
use crate::types::{schema, EntityState, OwnerId};

/// Where one tracker system lives.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrackerEndpoint {
    pub base_url: String,
    #[serde(default)]
    pub auth_token: Option<String>,
}

/// REST client for the configured tracker systems.
///
/// - `GET {base_url}/entities/{type}/{id}`: entity state, 404 means absent
/// - `PUT {base_url}/entities/{type}/{id}`: write state
/// - `DELETE {base_url}/entities/{type}/{id}`: delete, 404 is already done
/// - `GET {base_url}/references/{kind}?owner={owner}`: reference data
///
/// `ureq` is synchronous, so every request runs on the blocking pool.
pub struct HttpTracker {
    endpoints: HashMap<String, TrackerEndpoint>,
}

enum Method {
    Get,
    Put(Value),
    Delete,
}

impl HttpTracker {
    /// Build from configured endpoints. A missing `auth_token` falls back to
    /// `TRACKSYNC_TRACKER_<SYSTEM>_AUTH_TOKEN`.
    pub fn new(endpoints: HashMap<String, TrackerEndpoint>) -> Self {
        let endpoints = endpoints
            .into_iter()
            .map(|(system, mut endpoint)| {
                if endpoint.auth_token.is_none() {
                    let env_key = format!("TRACKSYNC_TRACKER_{}_AUTH_TOKEN", system.to_uppercase());
                    endpoint.auth_token = std::env::var(&env_key).ok();
                }
                (system, endpoint)
            })
            .collect();
        HttpTracker { endpoints }
    }

    pub fn systems(&self) -> impl Iterator<Item = &str> {
        self.endpoints.keys().map(String::as_str)
    }

    fn endpoint(&self, system: &str) -> Result<&TrackerEndpoint, TrackerError> {
        self.endpoints
            .get(system)
            .ok_or_else(|| TrackerError::UnknownSystem(system.to_string()))
    }

    fn entity_url(endpoint: &TrackerEndpoint, entity: &EntityRef) -> String {
        format!(
            "{}/entities/{}/{}",
            endpoint.base_url.trim_end_matches('/'),
            entity.entity_type,
            entity.entity_id
        )
    }

    /// Issue one request. `Ok(None)` means the tracker answered 404.
    async fn request(
        &self,
        system: &str,
        url: String,
        query: Option<(&'static str, String)>,
        method: Method,
    ) -> Result<Option<Value>, TrackerError> {
        let endpoint = self.endpoint(system)?;
        let auth_token = endpoint.auth_token.clone();
        let system_name = system.to_string();

        tokio::task::spawn_blocking(move || {
            let agent = ureq::Agent::new_with_defaults();
            let bearer = auth_token.map(|t| format!("Bearer {t}"));
            let fail = |e: ureq::Error| match e {
                ureq::Error::StatusCode(status) => TrackerError::Status {
                    system: system_name.clone(),
                    status,
                },
                other => TrackerError::Request {
                    system: system_name.clone(),
                    message: other.to_string(),
                },
            };

            let sent = match method {
                Method::Get => {
                    let mut request = agent.get(&url);
                    if let Some((key, value)) = &query {
                        request = request.query(*key, value);
                    }
                    if let Some(b) = &bearer {
                        request = request.header("Authorization", b);
                    }
                    request.call()
                }
                Method::Put(body) => {
                    let mut request = agent.put(&url);
                    if let Some(b) = &bearer {
                        request = request.header("Authorization", b);
                    }
                    request.send_json(&body)
                }
                Method::Delete => {
                    let mut request = agent.delete(&url);
                    if let Some(b) = &bearer {
                        request = request.header("Authorization", b);
                    }
                    request.call()
                }
            };

            let response = match sent {
                Ok(response) => response,
                Err(ureq::Error::StatusCode(404)) => return Ok(None),
                Err(e) => return Err(fail(e)),
            };
            if response.status().as_u16() == 204 {
                return Ok(Some(Value::Null));
            }
            let value: Value = response.into_body().read_json().map_err(|e| {
                TrackerError::InvalidPayload {
                    system: system_name.clone(),
                    message: format!("failed to parse response as JSON: {e}"),
                }
            })?;
            Ok(Some(value))
        })
        .await
        .map_err(|e| TrackerError::Request {
            system: system.to_string(),
            message: format!("task join error: {e}"),
        })?
    }
}

#[async_trait]
impl Tracker for HttpTracker {
    async fn fetch_entity(&self, entity: &EntityRef) -> Result<EntityState, TrackerError> {
        let url = Self::entity_url(self.endpoint(&entity.system)?, entity);
        match self.request(&entity.system, url, None, Method::Get).await? {
            None => Ok(EntityState::Absent),
            Some(value) => EntityState::from_json(&value).map_err(|e| TrackerError::InvalidPayload {
                system: entity.system.clone(),
                message: e.to_string(),
            }),
        }
    }

    async fn apply_mutation(
        &self,
        entity: &EntityRef,
        state: &EntityState,
    ) -> Result<(), TrackerError> {
        let url = Self::entity_url(self.endpoint(&entity.system)?, entity);
        let method = match state {
            EntityState::Present(payload) => {
                let body = payload
                    .decode::<Value>(schema::ENTITY_STATE)
                    .map_err(|e| TrackerError::InvalidPayload {
                        system: entity.system.clone(),
                        message: e.to_string(),
                    })?;
                Method::Put(body)
            }
            EntityState::Absent => Method::Delete,
        };
        let deleting = matches!(method, Method::Delete);
        match self.request(&entity.system, url, None, method).await? {
            Some(_) => Ok(()),
            // Deleting an entity that is already gone is a no-op.
            None if deleting => Ok(()),
            None => Err(TrackerError::Status {
                system: entity.system.clone(),
                status: 404,
            }),
        }
    }

    async fn fetch_reference(
        &self,
        system: &str,
        kind: &str,
        owner_id: &OwnerId,
    ) -> Result<Value, TrackerError> {
        let endpoint = self.endpoint(system)?;
        let url = format!(
            "{}/references/{}",
            endpoint.base_url.trim_end_matches('/'),
            kind
        );
        let query = Some(("owner", owner_id.as_str().to_string()));
        self.request(system, url, query, Method::Get)
            .await?
            .ok_or_else(|| TrackerError::Status {
                system: system.to_string(),
                status: 404,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(base_url: &str, token: Option<&str>) -> TrackerEndpoint {
        TrackerEndpoint {
            base_url: base_url.to_string(),
            auth_token: token.map(str::to_string),
        }
    }

    fn issue(system: &str) -> EntityRef {
        EntityRef {
            system: system.to_string(),
            entity_type: "issue".to_string(),
            entity_id: "X-1".to_string(),
        }
    }

    #[test]
    fn entity_url_trims_trailing_slash() {
        let url = HttpTracker::entity_url(&endpoint("http://jira.local/api/", None), &issue("jira"));
        assert_eq!(url, "http://jira.local/api/entities/issue/X-1");
    }

    #[test]
    fn configured_token_wins_over_env() {
        let tracker = HttpTracker::new(
            [("jira".to_string(), endpoint("http://x", Some("cfg-token")))]
                .into_iter()
                .collect(),
        );
        assert_eq!(
            tracker.endpoints["jira"].auth_token.as_deref(),
            Some("cfg-token")
        );
    }

    #[tokio::test]
    async fn unknown_system_is_reported() {
        let tracker = HttpTracker::new(HashMap::new());
        let err = tracker.fetch_entity(&issue("asana")).await.unwrap_err();
        assert_eq!(err, TrackerError::UnknownSystem("asana".to_string()));
    }

    #[tokio::test]
    async fn unreachable_tracker_is_a_request_error() {
        let tracker = HttpTracker::new(
            [("jira".to_string(), endpoint("http://127.0.0.1:1", None))]
                .into_iter()
                .collect(),
        );
        let err = tracker.fetch_entity(&issue("jira")).await.unwrap_err();
        assert!(matches!(err, TrackerError::Request { .. }), "{err:?}");
    }
}
