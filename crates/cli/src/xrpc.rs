use std::time::Duration;

use bytes::Bytes;
use common::export::{BlobPage, BlobSource, SourceError};
use common::fetch::{FetchError, Fetched, Fetcher};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use url::Url;

pub const PDS_SERVICE_ID: &str = "#atproto_pds";
pub const LIST_BLOBS_PAGE_SIZE: u32 = 500;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("HTTP status {0}: {1}")]
    HttpStatus(StatusCode, String),
    #[error("could not resolve {0}: {1}")]
    Identity(String, String),
}

/// A DID and the PDS that hosts its repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub did: String,
    pub pds: Url,
}

#[derive(Debug, Deserialize)]
struct ResolveHandleOutput {
    did: String,
}

#[derive(Debug, Deserialize)]
struct ListBlobsOutput {
    #[serde(default)]
    cursor: Option<String>,
    cids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DidDocument {
    #[serde(default)]
    service: Vec<DidService>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DidService {
    id: String,
    service_endpoint: serde_json::Value,
}

/// `{base}/xrpc/{method}`
pub fn xrpc_url(base: &Url, method: &str) -> Result<Url, ApiError> {
    let mut url = base.clone();
    url.set_query(None);
    url.path_segments_mut()
        .map_err(|_| ApiError::Identity(base.to_string(), "not a base url".into()))?
        .pop_if_empty()
        .push("xrpc")
        .push(method);
    Ok(url)
}

pub fn blob_url(pds: &Url, did: &str, cid: &str) -> Result<Url, ApiError> {
    let mut url = xrpc_url(pds, "com.atproto.sync.getBlob")?;
    url.query_pairs_mut()
        .append_pair("did", did)
        .append_pair("cid", cid);
    Ok(url)
}

/// Where a DID document lives: the PLC directory or `did:web`'s well-known path
pub fn did_document_url(plc_directory: &Url, did: &str) -> Result<Url, ApiError> {
    if did.starts_with("did:plc:") {
        let base = plc_directory.as_str().trim_end_matches('/');
        Ok(Url::parse(&format!("{}/{}", base, did))?)
    } else if let Some(host) = did.strip_prefix("did:web:") {
        let host = host.replace("%3A", ":");
        Ok(Url::parse(&format!("https://{}/.well-known/did.json", host))?)
    } else {
        Err(ApiError::Identity(
            did.to_string(),
            "unsupported did method".into(),
        ))
    }
}

/// The `#atproto_pds` service endpoint of a DID document
fn pds_endpoint(document: &DidDocument) -> Option<Url> {
    document
        .service
        .iter()
        .find(|service| service.id.ends_with(PDS_SERVICE_ID))
        .and_then(|service| service.service_endpoint.as_str())
        .and_then(|endpoint| Url::parse(endpoint).ok())
}

/// Thin client for the few sync and identity endpoints an export needs
#[derive(Debug, Clone)]
pub struct XrpcClient {
    client: Client,
    pds_url: Url,
    plc_directory: Url,
}

impl XrpcClient {
    pub fn new(pds_url: &Url, plc_directory: &Url, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder()
            .user_agent(common::version::build_info().tool_version())
            .connect_timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            pds_url: pds_url.clone(),
            plc_directory: plc_directory.clone(),
        })
    }

    pub fn http_client(&self) -> &Client {
        &self.client
    }

    /// Resolve a handle or DID to the DID and its PDS
    pub async fn resolve(&self, actor: &str) -> Result<Identity, ApiError> {
        let actor = actor.trim_start_matches('@');
        let did = if actor.starts_with("did:") {
            actor.to_string()
        } else {
            self.resolve_handle(actor).await?
        };

        let document_url = did_document_url(&self.plc_directory, &did)?;
        let document: DidDocument = self.get_json(document_url).await?;
        let pds = pds_endpoint(&document)
            .ok_or_else(|| ApiError::Identity(did.clone(), "no atproto_pds service".into()))?;

        tracing::debug!(did = %did, pds = %pds, "resolved identity");
        Ok(Identity { did, pds })
    }

    pub async fn resolve_handle(&self, handle: &str) -> Result<String, ApiError> {
        let mut url = xrpc_url(&self.pds_url, "com.atproto.identity.resolveHandle")?;
        url.query_pairs_mut().append_pair("handle", handle);
        let output: ResolveHandleOutput = self.get_json(url).await?;
        Ok(output.did)
    }

    /// Full repository as CAR bytes
    pub async fn get_repo(&self, pds: &Url, did: &str) -> Result<Bytes, ApiError> {
        let mut url = xrpc_url(pds, "com.atproto.sync.getRepo")?;
        url.query_pairs_mut().append_pair("did", did);
        tracing::info!(did = %did, "downloading repository");

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(ApiError::HttpStatus(
                response.status(),
                response.text().await?,
            ));
        }
        Ok(response.bytes().await?)
    }

    pub async fn list_blobs(
        &self,
        pds: &Url,
        did: &str,
        cursor: Option<&str>,
    ) -> Result<BlobPage, ApiError> {
        let mut url = xrpc_url(pds, "com.atproto.sync.listBlobs")?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("did", did)
                .append_pair("limit", &LIST_BLOBS_PAGE_SIZE.to_string());
            if let Some(cursor) = cursor {
                query.append_pair("cursor", cursor);
            }
        }
        let output: ListBlobsOutput = self.get_json(url).await?;
        Ok(BlobPage {
            cids: output.cids,
            cursor: output.cursor.filter(|c| !c.is_empty()),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T, ApiError> {
        let response = self.client.get(url).send().await?;
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            Err(ApiError::HttpStatus(
                response.status(),
                response.text().await?,
            ))
        }
    }
}

/// Blob listing and URLs for one repository on its PDS
#[derive(Debug, Clone)]
pub struct PdsBlobSource {
    client: XrpcClient,
    pds: Url,
}

impl PdsBlobSource {
    pub fn new(client: XrpcClient, pds: Url) -> Self {
        Self { client, pds }
    }
}

#[async_trait::async_trait]
impl BlobSource for PdsBlobSource {
    async fn list_blobs(&self, did: &str, cursor: Option<&str>) -> Result<BlobPage, SourceError> {
        self.client
            .list_blobs(&self.pds, did, cursor)
            .await
            .map_err(SourceError::new)
    }

    fn blob_url(&self, did: &str, cid: &str) -> Result<Url, SourceError> {
        blob_url(&self.pds, did, cid).map_err(SourceError::new)
    }
}

/// Plain GET for the download manager
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> Result<Fetched, FetchError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| FetchError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .await
            .map_err(|e| FetchError::Request(e.to_string()))?;

        Ok(Fetched {
            bytes,
            content_type,
        })
    }
}
