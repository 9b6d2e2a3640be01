//! HTTP client for the participant directory.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use crate::directory::{
    AccessTokenResponse, AuthMeResponse, Credentials, Directory, OnetimePreKeyUpload,
    ParticipantRecord, PublishBundleRequest, PublishedOnetimePreKey, UploadMode,
};
use crate::error::DirectoryError;

pub const DEVICE_HASH_HEADER: &str = "X-Device-Hash";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One directory endpoint: the route, the body and what comes back.
///
/// Credentials are attached by [`HttpDirectory::call`], never by the request.
pub trait DirectoryRequest {
    type Response: DeserializeOwned;

    /// Whether the endpoint identifies the device as well as the user.
    const DEVICE_BOUND: bool = true;

    fn build_request(&self, base_url: &Url, client: &Client) -> Result<RequestBuilder, DirectoryError>;
}

#[derive(Debug, Clone)]
pub struct HttpDirectory {
    remote: Url,
    client: Client,
}

impl HttpDirectory {
    pub fn new(remote: &Url) -> Result<Self, DirectoryError> {
        let client = Client::builder()
            .user_agent(concat!("nerdhub-prekeys/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            remote: remote.clone(),
            client,
        })
    }

    pub async fn call<T: DirectoryRequest>(
        &self,
        creds: &Credentials,
        request: T,
    ) -> Result<T::Response, DirectoryError> {
        let response = self.prepare(creds, &request)?.send().await?;
        let response = check_status(response).await?;
        Ok(response.json::<T::Response>().await?)
    }

    /// Route `request` against the directory and sign it with `creds`.
    fn prepare<T: DirectoryRequest>(
        &self,
        creds: &Credentials,
        request: &T,
    ) -> Result<RequestBuilder, DirectoryError> {
        let builder = request
            .build_request(&self.remote, &self.client)?
            .bearer_auth(&creds.access_token);
        if T::DEVICE_BOUND {
            Ok(builder.header(DEVICE_HASH_HEADER, &creds.device_hash))
        } else {
            Ok(builder)
        }
    }
}

async fn check_status(response: Response) -> Result<Response, DirectoryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    debug!(%status, body, "directory request failed");
    Err(status_error(status, body))
}

fn status_error(status: StatusCode, body: String) -> DirectoryError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => DirectoryError::Unauthorized(status, body),
        _ => DirectoryError::Status(status, body),
    }
}

fn participants_path(user_id: &str) -> String {
    format!("/users/{user_id}/e2ee_participants")
}

pub struct CreateParticipant<'a> {
    pub user_id: &'a str,
    pub body: &'a PublishBundleRequest,
}

impl DirectoryRequest for CreateParticipant<'_> {
    type Response = ParticipantRecord;

    fn build_request(&self, base_url: &Url, client: &Client) -> Result<RequestBuilder, DirectoryError> {
        let url = base_url.join(&participants_path(self.user_id))?;
        Ok(client.post(url).json(self.body))
    }
}

pub struct UpdatePreKeyBundle<'a> {
    pub user_id: &'a str,
    pub participant_id: &'a str,
    pub body: &'a PublishBundleRequest,
}

impl DirectoryRequest for UpdatePreKeyBundle<'_> {
    type Response = ParticipantRecord;

    fn build_request(&self, base_url: &Url, client: &Client) -> Result<RequestBuilder, DirectoryError> {
        let path = format!(
            "{}/{}/prekey_bundle",
            participants_path(self.user_id),
            self.participant_id
        );
        let url = base_url.join(&path)?;
        Ok(client.patch(url).json(self.body))
    }
}

pub struct CreateOnetimePreKeys<'a> {
    pub user_id: &'a str,
    pub participant_id: &'a str,
    pub keys: &'a [OnetimePreKeyUpload],
    pub mode: UploadMode,
}

impl DirectoryRequest for CreateOnetimePreKeys<'_> {
    type Response = Vec<PublishedOnetimePreKey>;

    const DEVICE_BOUND: bool = false;

    fn build_request(&self, base_url: &Url, client: &Client) -> Result<RequestBuilder, DirectoryError> {
        let path = format!(
            "{}/{}/onetime_prekeys",
            participants_path(self.user_id),
            self.participant_id
        );
        let mut url = base_url.join(&path)?;
        if self.mode == UploadMode::Append {
            url.query_pairs_mut().append_pair("append", "true");
        }
        Ok(client.post(url).json(self.keys))
    }
}

pub struct GetAccessToken;

impl DirectoryRequest for GetAccessToken {
    type Response = AccessTokenResponse;

    fn build_request(&self, base_url: &Url, client: &Client) -> Result<RequestBuilder, DirectoryError> {
        Ok(client.get(base_url.join("/auth/access_token")?))
    }
}

pub struct GetAuthUser;

impl DirectoryRequest for GetAuthUser {
    type Response = AuthMeResponse;

    fn build_request(&self, base_url: &Url, client: &Client) -> Result<RequestBuilder, DirectoryError> {
        Ok(client.get(base_url.join("/auth/me")?))
    }
}

#[async_trait]
impl Directory for HttpDirectory {
    async fn create_participant(
        &self,
        creds: &Credentials,
        user_id: &str,
        bundle: &PublishBundleRequest,
    ) -> Result<ParticipantRecord, DirectoryError> {
        self.call(creds, CreateParticipant { user_id, body: bundle }).await
    }

    async fn update_prekey_bundle(
        &self,
        creds: &Credentials,
        user_id: &str,
        participant_id: &str,
        bundle: &PublishBundleRequest,
    ) -> Result<ParticipantRecord, DirectoryError> {
        self.call(
            creds,
            UpdatePreKeyBundle {
                user_id,
                participant_id,
                body: bundle,
            },
        )
        .await
    }

    async fn create_onetime_prekeys(
        &self,
        creds: &Credentials,
        user_id: &str,
        participant_id: &str,
        keys: &[OnetimePreKeyUpload],
        mode: UploadMode,
    ) -> Result<Vec<PublishedOnetimePreKey>, DirectoryError> {
        self.call(
            creds,
            CreateOnetimePreKeys {
                user_id,
                participant_id,
                keys,
                mode,
            },
        )
        .await
    }

    async fn fetch_access_token(&self, creds: &Credentials) -> Result<String, DirectoryError> {
        Ok(self.call(creds, GetAccessToken).await?.access_token)
    }

    async fn fetch_participant(
        &self,
        creds: &Credentials,
    ) -> Result<Option<ParticipantRecord>, DirectoryError> {
        Ok(self.call(creds, GetAuthUser).await?.e2ee_participant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials {
        Credentials {
            access_token: "tok".into(),
            device_hash: "dev".into(),
        }
    }

    fn body() -> PublishBundleRequest {
        PublishBundleRequest {
            pub_identity_key: "a".into(),
            pub_signed_prekey: "b".into(),
            signed_prekey_signature: "c".into(),
        }
    }

    fn directory() -> HttpDirectory {
        HttpDirectory::new(&Url::parse("http://localhost:8000").unwrap()).unwrap()
    }

    fn built<T: DirectoryRequest>(request: &T) -> reqwest::Request {
        directory().prepare(&creds(), request).unwrap().build().unwrap()
    }

    #[test]
    fn create_participant_request_shape() {
        let body = body();
        let request = built(&CreateParticipant {
            user_id: "5",
            body: &body,
        });

        assert_eq!(request.method(), reqwest::Method::POST);
        assert_eq!(request.url().path(), "/users/5/e2ee_participants");
        assert_eq!(request.headers()[DEVICE_HASH_HEADER], "dev");
        assert_eq!(request.headers()["authorization"], "Bearer tok");
        assert_eq!(request.headers()["content-type"], "application/json");
    }

    #[test]
    fn update_bundle_is_patch() {
        let body = body();
        let request = built(&UpdatePreKeyBundle {
            user_id: "5",
            participant_id: "9",
            body: &body,
        });

        assert_eq!(request.method(), reqwest::Method::PATCH);
        assert_eq!(request.url().path(), "/users/5/e2ee_participants/9/prekey_bundle");
    }

    #[test]
    fn onetime_upload_mode_sets_query_flag() {
        let keys = vec![OnetimePreKeyUpload {
            id: "k".into(),
            pub_key: "p".into(),
        }];
        let build = |mode| {
            built(&CreateOnetimePreKeys {
                user_id: "5",
                participant_id: "9",
                keys: &keys,
                mode,
            })
        };

        let append = build(UploadMode::Append);
        assert_eq!(append.url().path(), "/users/5/e2ee_participants/9/onetime_prekeys");
        assert_eq!(append.url().query(), Some("append=true"));
        assert_eq!(append.headers()["authorization"], "Bearer tok");
        assert!(append.headers().get(DEVICE_HASH_HEADER).is_none());

        let flush = build(UploadMode::Flush);
        assert_eq!(flush.url().query(), None);
    }

    #[test]
    fn auth_requests_carry_device_hash() {
        let token = built(&GetAccessToken);
        assert_eq!(token.url().path(), "/auth/access_token");
        assert_eq!(token.headers()[DEVICE_HASH_HEADER], "dev");

        let me = built(&GetAuthUser);
        assert_eq!(me.url().path(), "/auth/me");
        assert_eq!(me.headers()[DEVICE_HASH_HEADER], "dev");
    }

    #[test]
    fn refused_token_is_told_apart_from_other_failures() {
        for status in [StatusCode::UNAUTHORIZED, StatusCode::FORBIDDEN] {
            assert!(matches!(
                status_error(status, "expired".into()),
                DirectoryError::Unauthorized(s, body) if s == status && body == "expired"
            ));
        }
        assert!(matches!(
            status_error(StatusCode::UNPROCESSABLE_ENTITY, "bad key".into()),
            DirectoryError::Status(StatusCode::UNPROCESSABLE_ENTITY, _)
        ));
    }
}
