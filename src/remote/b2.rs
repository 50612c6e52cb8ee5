//! Backblaze B2 batch transport.
//!
//! Downloads are plain HTTP GETs against the bucket's download URL, so they
//! can be served by a CDN in front of it. Uploads go through the native B2
//! API: authorize once, resolve the bucket id, then fetch an upload URL per
//! upload. The authorization is cached and refreshed when B2 expires it.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::Mutex;

use super::{decode_batch, encode_batch, object_name, BatchStore};
use crate::error::StorageError;
use crate::types::Leaf;

const API_BASE: &str = "https://api.backblazeb2.com";
const TRANSPORT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, Deserialize)]
struct Authorization {
    #[serde(rename = "authorizationToken")]
    token: String,
    #[serde(rename = "apiUrl")]
    api_url: String,
    #[serde(rename = "accountId")]
    account_id: String,
}

#[derive(Debug, Deserialize)]
struct ListBucketsResponse {
    buckets: Vec<Bucket>,
}

#[derive(Debug, Deserialize)]
struct Bucket {
    #[serde(rename = "bucketId")]
    bucket_id: String,
    #[serde(rename = "bucketName")]
    bucket_name: String,
}

#[derive(Debug, Deserialize)]
struct UploadTarget {
    #[serde(rename = "uploadUrl")]
    upload_url: String,
    #[serde(rename = "authorizationToken")]
    token: String,
}

#[derive(Clone)]
struct Session {
    auth: Authorization,
    bucket_id: String,
}

pub struct B2Store {
    http: reqwest::Client,
    acct_id: String,
    app_key: String,
    bucket: String,
    download_url: String,
    session: Mutex<Option<Session>>,
}

impl B2Store {
    /// `acct_id` and `app_key` are the account id and application key of the
    /// bucket named `bucket`; `download_url` is the base URL downloads go
    /// through.
    pub fn new(
        acct_id: impl Into<String>,
        app_key: impl Into<String>,
        bucket: impl Into<String>,
        download_url: impl Into<String>,
    ) -> Result<Self, StorageError> {
        let http = reqwest::Client::builder()
            .timeout(TRANSPORT_TIMEOUT)
            .connect_timeout(TRANSPORT_TIMEOUT)
            .pool_max_idle_per_host(3)
            .build()?;
        Ok(B2Store {
            http,
            acct_id: acct_id.into(),
            app_key: app_key.into(),
            bucket: bucket.into(),
            download_url: download_url.into(),
            session: Mutex::new(None),
        })
    }

    async fn session(&self) -> Result<Session, StorageError> {
        let mut cached = self.session.lock().await;
        if let Some(session) = cached.as_ref() {
            return Ok(session.clone());
        }

        let basic = STANDARD.encode(format!("{}:{}", self.acct_id, self.app_key));
        let response = self
            .http
            .get(format!("{API_BASE}/b2api/v2/b2_authorize_account"))
            .header("Authorization", format!("Basic {basic}"))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(StorageError::RemoteStatus(response.status().as_u16()));
        }
        let auth: Authorization = serde_json::from_slice(&response.bytes().await?)?;

        let body = serde_json::to_vec(&serde_json::json!({
            "accountId": auth.account_id,
            "bucketName": self.bucket,
        }))?;
        let response = self
            .http
            .post(format!("{}/b2api/v2/b2_list_buckets", auth.api_url))
            .header("Authorization", auth.token.as_str())
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(StorageError::RemoteStatus(response.status().as_u16()));
        }
        let listed: ListBucketsResponse = serde_json::from_slice(&response.bytes().await?)?;
        let bucket_id = listed
            .buckets
            .into_iter()
            .find(|bucket| bucket.bucket_name == self.bucket)
            .map(|bucket| bucket.bucket_id)
            .ok_or_else(|| StorageError::BadInput(format!("unknown bucket: {}", self.bucket)))?;

        let session = Session { auth, bucket_id };
        *cached = Some(session.clone());
        Ok(session)
    }

    async fn invalidate_session(&self) {
        *self.session.lock().await = None;
    }

    async fn upload_target(&self, session: &Session) -> Result<UploadTarget, StorageError> {
        let body = serde_json::to_vec(&serde_json::json!({
            "bucketId": session.bucket_id,
        }))?;
        let response = self
            .http
            .post(format!("{}/b2api/v2/b2_get_upload_url", session.auth.api_url))
            .header("Authorization", session.auth.token.as_str())
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(StorageError::RemoteStatus(response.status().as_u16()));
        }
        Ok(serde_json::from_slice(&response.bytes().await?)?)
    }
}

impl BatchStore for B2Store {
    async fn get_batch(&self, tree_id: i64, batch: i64) -> Result<Vec<Leaf>, StorageError> {
        let url = format!("{}/{}", self.download_url, object_name(tree_id, batch));
        let response = self.http.get(&url).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(StorageError::LeavesNotFound),
            status if !status.is_success() => Err(StorageError::RemoteStatus(status.as_u16())),
            _ => decode_batch(&response.bytes().await?),
        }
    }

    async fn put_batch(
        &self,
        tree_id: i64,
        batch: i64,
        leaves: &[Leaf],
    ) -> Result<(), StorageError> {
        let body = encode_batch(leaves)?;
        let name = object_name(tree_id, batch);

        let mut retried = false;
        loop {
            let session = self.session().await?;
            let target = self.upload_target(&session).await?;
            let response = self
                .http
                .post(&target.upload_url)
                .header("Authorization", target.token.as_str())
                .header("X-Bz-File-Name", name.as_str())
                .header("Content-Type", "application/json")
                .header("X-Bz-Content-Sha1", "do_not_verify")
                .body(body.clone())
                .send()
                .await?;

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED && !retried {
                // the cached authorization expired; fetch a fresh one
                self.invalidate_session().await;
                retried = true;
                continue;
            }
            if !status.is_success() {
                tracing::warn!(object = %name, status = status.as_u16(), "batch upload failed");
                return Err(StorageError::RemoteStatus(status.as_u16()));
            }
            return Ok(());
        }
    }
}
