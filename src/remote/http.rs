//! HTTP implementation of [`RemoteApi`].
//!
//! Paths are `{base_url}/api/{resource}/...`, where `resource` defaults to the
//! kind's plural name and can be overridden for scoped feeds such as a user's
//! wall (`{author_id}/wall`) or job list (`{user_id}/jobs`).

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::auth::AuthContext;
use crate::config::RemoteConfig;
use crate::entity::{Entity, EntityId, SetField};
use crate::error::SyncError;
use crate::mutation::OperationKind;
use crate::remote::RemoteApi;

/// User agent sent with every request.
pub fn user_agent() -> &'static str {
    concat!("feed-sync/", env!("CARGO_PKG_VERSION"))
}

/// Build the shared HTTP client.
pub fn build_client(config: &RemoteConfig) -> Result<Client, SyncError> {
    Client::builder()
        .user_agent(user_agent())
        .timeout(config.request_timeout())
        .build()
        .map_err(|e| SyncError::Network(e.to_string()))
}

/// Parse the configured base URL, normalised to end with `/`.
pub fn parse_base(config: &RemoteConfig) -> Result<Url, SyncError> {
    let mut base = config.base_url.clone();
    if !base.ends_with('/') {
        base.push('/');
    }
    Url::parse(&base).map_err(|e| SyncError::RemoteRejected {
        status: 0,
        message: format!("invalid base url {base}: {e}"),
    })
}

/// Map a transport error.
pub(crate) fn transport_error(err: reqwest::Error) -> SyncError {
    if err.is_decode() {
        SyncError::RemoteRejected {
            status: err.status().map_or(200, |s| s.as_u16()),
            message: format!("malformed response body: {err}"),
        }
    } else {
        SyncError::Network(err.to_string())
    }
}

/// Turn a non-success response into the matching error.
pub(crate) async fn status_error(
    resp: Response,
    not_found: Option<SyncError>,
) -> SyncError {
    let status = resp.status();
    if status == StatusCode::NOT_FOUND {
        if let Some(err) = not_found {
            return err;
        }
    }
    let text = resp.text().await.unwrap_or_default();
    SyncError::RemoteRejected {
        status: status.as_u16(),
        message: text,
    }
}

/// reqwest-backed remote for kind `E`.
pub struct HttpRemote<E> {
    client: Client,
    base: Url,
    resource: String,
    auth: Arc<dyn AuthContext>,
    _kind: PhantomData<fn() -> E>,
}

impl<E: Entity> HttpRemote<E> {
    pub fn new(config: &RemoteConfig, auth: Arc<dyn AuthContext>) -> Result<Self, SyncError> {
        Ok(Self::with_client(build_client(config)?, parse_base(config)?, auth))
    }

    pub fn with_client(client: Client, base: Url, auth: Arc<dyn AuthContext>) -> Self {
        Self {
            client,
            base,
            resource: E::KIND.resource().to_string(),
            auth,
            _kind: PhantomData,
        }
    }

    /// Scope the remote to a different resource path, e.g. `"7/wall"`.
    pub fn scoped(mut self, resource: impl Into<String>) -> Self {
        self.resource = resource.into();
        self
    }

    fn url(&self, path: &str) -> Result<Url, SyncError> {
        let full = if path.is_empty() {
            format!("api/{}", self.resource)
        } else {
            format!("api/{}/{}", self.resource, path)
        };
        self.base
            .join(&full)
            .map_err(|e| SyncError::RemoteRejected {
                status: 0,
                message: format!("invalid path {full}: {e}"),
            })
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, SyncError> {
        let mut req = self.client.request(method, self.url(path)?);
        if let Some(token) = self.auth.current().token {
            req = req.bearer_auth(token);
        }
        Ok(req)
    }

    async fn execute(
        &self,
        req: RequestBuilder,
        point: Option<EntityId>,
    ) -> Result<Response, SyncError> {
        let resp = req.send().await.map_err(transport_error)?;
        debug!(kind = %E::KIND, status = %resp.status(), url = %resp.url(), "Remote response");
        if resp.status().is_success() {
            return Ok(resp);
        }
        let not_found = point.map(|id| SyncError::NotFound { kind: E::KIND, id });
        Err(status_error(resp, not_found).await)
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        req: RequestBuilder,
        point: Option<EntityId>,
    ) -> Result<T, SyncError> {
        let resp = self.execute(req, point).await?;
        let status = resp.status().as_u16();
        let bytes = resp.bytes().await.map_err(transport_error)?;
        serde_json::from_slice(&bytes).map_err(|e| SyncError::RemoteRejected {
            status,
            message: format!("failed to parse body: {e}"),
        })
    }

    fn membership_unsupported(&self, field: SetField, operation: OperationKind) -> Option<SyncError> {
        (!E::set_fields().contains(&field)).then_some(SyncError::Unsupported {
            kind: E::KIND,
            operation,
        })
    }
}

#[async_trait]
impl<E: Entity> RemoteApi<E> for HttpRemote<E> {
    async fn get_latest(&self, count: usize) -> Result<Vec<E>, SyncError> {
        let req = self.request(Method::GET, "latest")?.query(&[("count", count)]);
        self.fetch(req, None).await
    }

    async fn get_before(&self, id: EntityId, count: usize) -> Result<Vec<E>, SyncError> {
        let req = self
            .request(Method::GET, &format!("{id}/before"))?
            .query(&[("count", count)]);
        self.fetch(req, None).await
    }

    async fn get_after(&self, id: EntityId, count: usize) -> Result<Vec<E>, SyncError> {
        let req = self
            .request(Method::GET, &format!("{id}/after"))?
            .query(&[("count", count)]);
        self.fetch(req, None).await
    }

    async fn get_newer(&self, id: EntityId) -> Result<Vec<E>, SyncError> {
        let req = self.request(Method::GET, &format!("{id}/newer"))?;
        self.fetch(req, None).await
    }

    async fn get_by_id(&self, id: EntityId) -> Result<E, SyncError> {
        let req = self.request(Method::GET, &id.to_string())?;
        self.fetch(req, Some(id)).await
    }

    async fn save(&self, record: E) -> Result<E, SyncError> {
        let point = (record.id() > 0).then_some(record.id());
        let req = self.request(Method::POST, "")?.json(&record);
        self.fetch(req, point).await
    }

    async fn delete_by_id(&self, id: EntityId) -> Result<(), SyncError> {
        let req = self.request(Method::DELETE, &id.to_string())?;
        self.execute(req, Some(id)).await?;
        Ok(())
    }

    async fn like(&self, id: EntityId) -> Result<E, SyncError> {
        let req = self.request(Method::POST, &format!("{id}/likes"))?;
        self.fetch(req, Some(id)).await
    }

    async fn unlike(&self, id: EntityId) -> Result<E, SyncError> {
        let req = self.request(Method::DELETE, &format!("{id}/likes"))?;
        self.fetch(req, Some(id)).await
    }

    async fn participate(&self, id: EntityId) -> Result<E, SyncError> {
        if let Some(err) = self.membership_unsupported(SetField::Participants, OperationKind::Participate) {
            return Err(err);
        }
        let req = self.request(Method::POST, &format!("{id}/participants"))?;
        self.fetch(req, Some(id)).await
    }

    async fn unparticipate(&self, id: EntityId) -> Result<E, SyncError> {
        if let Some(err) =
            self.membership_unsupported(SetField::Participants, OperationKind::Unparticipate)
        {
            return Err(err);
        }
        let req = self.request(Method::DELETE, &format!("{id}/participants"))?;
        self.fetch(req, Some(id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SharedAuth;
    use crate::entity::{Event, Post};

    fn remote<E: Entity>(base: &str) -> HttpRemote<E> {
        let config = RemoteConfig {
            base_url: base.to_string(),
            ..Default::default()
        };
        HttpRemote::new(&config, Arc::new(SharedAuth::anonymous())).unwrap()
    }

    #[test]
    fn test_url_layout() {
        let posts: HttpRemote<Post> = remote("http://example.test");
        assert_eq!(
            posts.url("latest").unwrap().as_str(),
            "http://example.test/api/posts/latest"
        );
        assert_eq!(posts.url("").unwrap().as_str(), "http://example.test/api/posts");

        let wall: HttpRemote<Post> = remote::<Post>("http://example.test/v2").scoped("7/wall");
        assert_eq!(
            wall.url("12/before").unwrap().as_str(),
            "http://example.test/v2/api/7/wall/12/before"
        );
    }

    #[tokio::test]
    async fn test_participation_rejected_for_posts_without_network() {
        let posts: HttpRemote<Post> = remote("http://127.0.0.1:9");
        let err = posts.participate(1).await.unwrap_err();
        assert!(matches!(err, SyncError::Unsupported { .. }));

        let events: HttpRemote<Event> = remote("http://127.0.0.1:9");
        assert!(events.membership_unsupported(SetField::Participants, OperationKind::Participate).is_none());
    }
}
