//! S3 corpus access over the REST API.
//!
//! Lists and downloads objects with AWS Signature V4 auth, implemented on
//! `hmac` + `sha2` so no AWS SDK or C dependency is pulled in. Handles
//! `ListObjectsV2` pagination and S3-compatible endpoints (MinIO et al.)
//! via `AWS_ENDPOINT_URL`.

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::SourceError;

type HmacSha256 = Hmac<Sha256>;

/// Credentials read from the standard AWS environment variables.
struct Credentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl Credentials {
    fn from_env() -> Result<Self, SourceError> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID").map_err(|_| {
            SourceError::CredentialsError("AWS_ACCESS_KEY_ID is not set".to_string())
        })?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY").map_err(|_| {
            SourceError::CredentialsError("AWS_SECRET_ACCESS_KEY is not set".to_string())
        })?;
        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token: std::env::var("AWS_SESSION_TOKEN").ok(),
        })
    }
}

pub struct S3Client {
    bucket: String,
    prefix: String,
    region: String,
    endpoint: Option<String>,
    creds: Credentials,
    http: reqwest::Client,
}

impl S3Client {
    pub fn new(bucket: &str, prefix: &str) -> Result<Self, SourceError> {
        let region = std::env::var("AWS_REGION")
            .or_else(|_| std::env::var("AWS_DEFAULT_REGION"))
            .unwrap_or_else(|_| "us-east-1".to_string());

        Ok(Self {
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
            region,
            endpoint: std::env::var("AWS_ENDPOINT_URL").ok(),
            creds: Credentials::from_env()?,
            http: reqwest::Client::new(),
        })
    }

    fn host(&self) -> String {
        match &self.endpoint {
            Some(endpoint) => endpoint
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_end_matches('/')
                .to_string(),
            None => format!("{}.s3.{}.amazonaws.com", self.bucket, self.region),
        }
    }

    /// All `.jsonl` object keys under the prefix, following pagination.
    pub async fn list_jsonl_keys(&self) -> Result<Vec<String>, SourceError> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("max-keys".to_string(), "1000".to_string()),
            ];
            if !self.prefix.is_empty() {
                query.push(("prefix".to_string(), self.prefix.clone()));
            }
            if let Some(token) = &continuation {
                query.push(("continuation-token".to_string(), token.clone()));
            }

            let xml = self
                .signed_get("/", &query)
                .await
                .map_err(|e| SourceError::ListError(e.to_string()))?;

            let mut rest = xml.as_str();
            while let Some(start) = rest.find("<Key>") {
                let after = &rest[start + "<Key>".len()..];
                let Some(end) = after.find("</Key>") else {
                    break;
                };
                let key = &after[..end];
                if key.ends_with(".jsonl") {
                    keys.push(key.to_string());
                }
                rest = &after[end..];
            }

            let truncated = extract_tag(&xml, "IsTruncated")
                .map(|v| v == "true")
                .unwrap_or(false);
            if !truncated {
                break;
            }
            continuation = extract_tag(&xml, "NextContinuationToken");
            if continuation.is_none() {
                break;
            }
        }

        keys.sort();
        Ok(keys)
    }

    /// Download one object's body.
    pub async fn fetch(&self, key: &str) -> Result<String, SourceError> {
        let encoded_key = key
            .split('/')
            .map(uri_encode)
            .collect::<Vec<_>>()
            .join("/");
        self.signed_get(&format!("/{encoded_key}"), &[]).await
    }

    /// Issue one SigV4-signed GET and return the response body.
    async fn signed_get(
        &self,
        canonical_uri: &str,
        query: &[(String, String)],
    ) -> Result<String, SourceError> {
        let host = self.host();
        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let payload_hash = hex_sha256(b"");

        let mut sorted_query = query.to_vec();
        sorted_query.sort_by(|a, b| a.0.cmp(&b.0));
        let canonical_query: String = sorted_query
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let mut headers = vec![
            ("host".to_string(), host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(token) = &self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String =
            headers.iter().map(|(k, v)| format!("{k}:{v}\n")).collect();

        let canonical_request = format!(
            "GET\n{canonical_uri}\n{canonical_query}\n{canonical_headers}\n{signed_headers}\n{payload_hash}"
        );
        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key = derive_signing_key(
            &self.creds.secret_access_key,
            &date_stamp,
            &self.region,
            "s3",
        );
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));
        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.creds.access_key_id, credential_scope, signed_headers, signature
        );

        let scheme = match &self.endpoint {
            Some(e) if e.starts_with("http://") => "http",
            _ => "https",
        };
        let url = if canonical_query.is_empty() {
            format!("{scheme}://{host}{canonical_uri}")
        } else {
            format!("{scheme}://{host}{canonical_uri}?{canonical_query}")
        };

        let mut request = self
            .http
            .get(&url)
            .header("Authorization", &authorization)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &amz_date);
        if let Some(token) = &self.creds.session_token {
            request = request.header("x-amz-security-token", token);
        }

        let response = request.send().await.map_err(|e| {
            SourceError::FetchError(format!("s3://{}{}: {}", self.bucket, canonical_uri, e))
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::FetchError(format!(
                "s3://{}{} HTTP {}: {}",
                self.bucket,
                canonical_uri,
                status,
                body.chars().take(300).collect::<String>()
            )));
        }

        response
            .text()
            .await
            .map_err(|e| SourceError::FetchError(format!("read body: {e}")))
    }
}

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

// kSigning = HMAC(HMAC(HMAC(HMAC("AWS4"+secret, date), region), service), "aws4_request")
fn derive_signing_key(secret: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 encoding with only unreserved characters left bare.
fn uri_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Text content of a simple, non-nested XML tag.
fn extract_tag(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)?;
    Some(xml[start..start + end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_encode_leaves_unreserved() {
        assert_eq!(uri_encode("abc-123_.~"), "abc-123_.~");
        assert_eq!(uri_encode("a/b c"), "a%2Fb%20c");
    }

    #[test]
    fn signing_key_is_deterministic() {
        let a = derive_signing_key("secret", "20260101", "us-east-1", "s3");
        let b = derive_signing_key("secret", "20260101", "us-east-1", "s3");
        assert_eq!(a, b);
        let c = derive_signing_key("secret", "20260102", "us-east-1", "s3");
        assert_ne!(a, c);
    }

    #[test]
    fn extracts_simple_tags() {
        let xml = "<R><IsTruncated>true</IsTruncated><NextContinuationToken>abc</NextContinuationToken></R>";
        assert_eq!(extract_tag(xml, "IsTruncated").as_deref(), Some("true"));
        assert_eq!(extract_tag(xml, "NextContinuationToken").as_deref(), Some("abc"));
        assert!(extract_tag(xml, "Missing").is_none());
    }

    #[test]
    fn key_scan_filters_extension() {
        let xml = "<R>\
            <Contents><Key>a/x.jsonl</Key></Contents>\
            <Contents><Key>a/y.parquet</Key></Contents>\
            <Contents><Key>b/z.jsonl</Key></Contents>\
            <IsTruncated>false</IsTruncated></R>";
        let mut keys = Vec::new();
        let mut rest = xml;
        while let Some(start) = rest.find("<Key>") {
            let after = &rest[start + 5..];
            let end = after.find("</Key>").unwrap();
            let key = &after[..end];
            if key.ends_with(".jsonl") {
                keys.push(key.to_string());
            }
            rest = &after[end..];
        }
        assert_eq!(keys, vec!["a/x.jsonl", "b/z.jsonl"]);
    }
}
