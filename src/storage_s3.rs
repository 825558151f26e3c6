//! Amazon S3 object store.
//!
//! Lists and streams objects using the S3 REST API with AWS Signature V4
//! authentication. Listing follows `ListObjectsV2` continuation tokens;
//! downloads hand back the response body as a chunk stream so large files
//! are never buffered whole.
//!
//! Uses only pure-Rust dependencies (`hmac`, `sha2`) for signing.
//!
//! # Configuration
//!
//! ```toml
//! [storage]
//! kind = "s3"
//! prefix = "uploads/"
//!
//! [storage.s3]
//! bucket = "sensor-drops"
//! region = "eu-west-1"
//! # endpoint_url = "http://localhost:9000"   # MinIO, path-style
//! ```
//!
//! # Environment Variables
//!
//! - `AWS_ACCESS_KEY_ID` (required)
//! - `AWS_SECRET_ACCESS_KEY` (required)
//! - `AWS_SESSION_TOKEN` (optional)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use hmac::{Hmac, Mac};
use quick_xml::events::Event;
use quick_xml::Reader;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::S3StorageConfig;
use crate::error::StorageError;
use crate::listing::{ByteStream, ObjectStore};
use crate::models::StorageFile;

type HmacSha256 = Hmac<Sha256>;

/// AWS credentials used for request signing.
#[derive(Clone)]
pub struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: Option<String>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token,
        }
    }

    /// Load credentials from `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`,
    /// and optionally `AWS_SESSION_TOKEN`.
    pub fn from_env() -> Result<Self, StorageError> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID").map_err(|_| {
            StorageError::Config("AWS_ACCESS_KEY_ID environment variable not set".into())
        })?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY").map_err(|_| {
            StorageError::Config("AWS_SECRET_ACCESS_KEY environment variable not set".into())
        })?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self::new(access_key_id, secret_access_key, session_token))
    }
}

/// Where requests go and how object paths map onto URLs.
struct Endpoint {
    scheme: String,
    host: String,
    /// `Some(bucket)` for path-style addressing.
    path_bucket: Option<String>,
}

impl Endpoint {
    fn from_config(config: &S3StorageConfig) -> Self {
        match &config.endpoint_url {
            Some(url) => {
                let scheme = if url.starts_with("http://") { "http" } else { "https" };
                let host = url
                    .trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .trim_end_matches('/')
                    .to_string();
                Self {
                    scheme: scheme.to_string(),
                    host,
                    path_bucket: Some(config.bucket.clone()),
                }
            }
            None if config.path_style => Self {
                scheme: "https".to_string(),
                host: format!("s3.{}.amazonaws.com", config.region),
                path_bucket: Some(config.bucket.clone()),
            },
            None => Self {
                scheme: "https".to_string(),
                host: format!("{}.s3.{}.amazonaws.com", config.bucket, config.region),
                path_bucket: None,
            },
        }
    }

    /// Canonical (already URI-encoded) path for `key`; empty key addresses
    /// the bucket itself.
    fn canonical_uri(&self, key: &str) -> String {
        let encoded_key = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        match (&self.path_bucket, key.is_empty()) {
            (Some(bucket), true) => format!("/{}", uri_encode(bucket)),
            (Some(bucket), false) => format!("/{}/{}", uri_encode(bucket), encoded_key),
            (None, true) => "/".to_string(),
            (None, false) => format!("/{}", encoded_key),
        }
    }
}

pub struct S3Store {
    config: S3StorageConfig,
    creds: AwsCredentials,
    endpoint: Endpoint,
    client: reqwest::Client,
}

impl S3Store {
    /// Create a store using credentials from the environment.
    pub fn new(config: S3StorageConfig) -> Result<Self, StorageError> {
        let creds = AwsCredentials::from_env()?;
        Ok(Self::with_credentials(config, creds))
    }

    pub fn with_credentials(config: S3StorageConfig, creds: AwsCredentials) -> Self {
        let endpoint = Endpoint::from_config(&config);
        Self {
            config,
            creds,
            endpoint,
            client: reqwest::Client::new(),
        }
    }

    /// Build a SigV4-signed GET for `canonical_uri` with the given query.
    fn signed_get(&self, canonical_uri: &str, query: &[(String, String)]) -> reqwest::RequestBuilder {
        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        // Canonical query string must be sorted by key
        let mut sorted = query.to_vec();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        let canonical_querystring = sorted
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let payload_hash = hex_sha256(b"");

        let mut headers = vec![
            ("host".to_string(), self.endpoint.host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_request = format!(
            "GET\n{}\n{}\n{}\n{}\n{}",
            canonical_uri, canonical_querystring, canonical_headers, signed_headers, payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.config.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key = derive_signing_key(
            &self.creds.secret_access_key,
            &date_stamp,
            &self.config.region,
            "s3",
        );
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.creds.access_key_id, credential_scope, signed_headers, signature
        );

        let mut url = format!("{}://{}{}", self.endpoint.scheme, self.endpoint.host, canonical_uri);
        if !canonical_querystring.is_empty() {
            url.push('?');
            url.push_str(&canonical_querystring);
        }

        let mut req = self
            .client
            .get(&url)
            .header("Authorization", authorization)
            .header("x-amz-content-sha256", payload_hash)
            .header("x-amz-date", amz_date);
        if let Some(ref token) = self.creds.session_token {
            req = req.header("x-amz-security-token", token);
        }
        req
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    fn kind(&self) -> &str {
        "s3"
    }

    async fn list(&self, prefix: &str) -> Result<Vec<StorageFile>, StorageError> {
        let mut files = Vec::new();
        let mut continuation_token: Option<String> = None;
        let canonical_uri = self.endpoint.canonical_uri("");

        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("max-keys".to_string(), "1000".to_string()),
            ];
            if !prefix.is_empty() {
                query.push(("prefix".to_string(), prefix.to_string()));
            }
            if let Some(ref token) = continuation_token {
                query.push(("continuation-token".to_string(), token.clone()));
            }

            let resp = self
                .signed_get(&canonical_uri, &query)
                .send()
                .await
                .map_err(|e| {
                    StorageError::Transport(format!(
                        "failed to list s3://{}/{}: {}",
                        self.config.bucket, prefix, e
                    ))
                })?;

            if !resp.status().is_success() {
                return Err(status_error(resp.status().as_u16(), prefix));
            }

            let body = resp
                .text()
                .await
                .map_err(|e| StorageError::Transport(e.to_string()))?;
            let page = parse_list_objects_response(&body)?;
            debug!(objects = page.files.len(), truncated = page.is_truncated, "s3 list page");
            files.extend(page.files);

            match (page.is_truncated, page.next_token) {
                (true, Some(token)) => continuation_token = Some(token),
                _ => break,
            }
        }

        Ok(files)
    }

    async fn download(&self, path: &str) -> Result<ByteStream, StorageError> {
        let resp = self
            .signed_get(&self.endpoint.canonical_uri(path), &[])
            .send()
            .await
            .map_err(|e| {
                StorageError::Transport(format!(
                    "failed to get s3://{}/{}: {}",
                    self.config.bucket, path, e
                ))
            })?;

        if !resp.status().is_success() {
            return Err(status_error(resp.status().as_u16(), path));
        }

        let stream = resp.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::pin(stream))
    }
}

fn status_error(status: u16, path: &str) -> StorageError {
    match status {
        404 => StorageError::NotFound(path.to_string()),
        401 | 403 => StorageError::PermissionDenied(path.to_string()),
        _ => StorageError::Http {
            status,
            path: path.to_string(),
        },
    }
}

// ============ AWS SigV4 Helpers ============

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Derive the AWS SigV4 signing key for a given date, region, and service.
///
/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// URI-encode per RFC 3986, leaving only `A-Z a-z 0-9 - _ . ~` as-is.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}

// ============ ListObjectsV2 Parsing ============

#[derive(Debug, Default)]
struct ListPage {
    files: Vec<StorageFile>,
    is_truncated: bool,
    next_token: Option<String>,
}

#[derive(Default)]
struct PartialObject {
    key: String,
    size: u64,
    last_modified: DateTime<Utc>,
}

fn parse_list_objects_response(xml: &str) -> Result<ListPage, StorageError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut page = ListPage::default();
    let mut current: Option<PartialObject> = None;
    let mut tag = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if tag == "Contents" {
                    current = Some(PartialObject::default());
                }
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| StorageError::Transport(format!("bad XML text: {}", e)))?
                    .into_owned();
                match (current.as_mut(), tag.as_str()) {
                    (Some(obj), "Key") => obj.key = text,
                    (Some(obj), "Size") => {
                        obj.size = text
                            .parse()
                            .map_err(|_| malformed_field("Size", &text, &obj.key))?;
                    }
                    (Some(obj), "LastModified") => {
                        obj.last_modified = DateTime::parse_from_rfc3339(&text)
                            .map(|dt| dt.with_timezone(&Utc))
                            .map_err(|_| malformed_field("LastModified", &text, &obj.key))?;
                    }
                    (None, "IsTruncated") => page.is_truncated = text == "true",
                    (None, "NextContinuationToken") => page.next_token = Some(text),
                    _ => {}
                }
            }
            Ok(Event::End(e)) => {
                if e.name().as_ref() == b"Contents" {
                    if let Some(obj) = current.take() {
                        // Zero-byte "directory" markers end in '/'
                        if !obj.key.is_empty() && !obj.key.ends_with('/') {
                            page.files.push(StorageFile {
                                path: obj.key,
                                size: obj.size,
                                last_modified: obj.last_modified,
                            });
                        }
                    }
                }
                tag.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(StorageError::Transport(format!(
                    "malformed ListObjectsV2 response: {}",
                    e
                )))
            }
            _ => {}
        }
    }

    Ok(page)
}

fn malformed_field(field: &str, value: &str, key: &str) -> StorageError {
    StorageError::Transport(format!(
        "malformed ListObjectsV2 response: bad {} '{}' for key '{}'",
        field, value, key
    ))
}
