//! AWS Signature Version 4 request signing for Bedrock Runtime.
//!
//! Implemented directly on `hmac`/`sha2`; there is no AWS SDK dependency.
//! Signing is a pure function of the credentials, the request and the
//! supplied timestamp, so callers must re-sign every HTTP attempt.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Url;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::error::{GatewayError, Result};
use crate::models::Credentials;

type HmacSha256 = Hmac<Sha256>;

pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";
/// SigV4 service name (AWS signs as "bedrock", not "bedrock-runtime").
pub const SIGNING_SERVICE: &str = "bedrock";

/// Lowercase header name → value, sorted by name.
pub type SignedHeaders = BTreeMap<String, String>;

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| GatewayError::Config(format!("invalid signing key: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Derive the daily signing key via the HMAC chain.
pub fn derive_signing_key(
    secret: &str,
    date_stamp: &str,
    region: &str,
    service: &str,
) -> Result<Vec<u8>> {
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date_stamp.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 encoding: everything except `A-Z a-z 0-9 - . _ ~` is percent-encoded.
pub fn uri_encode(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

/// Canonical URI: every path segment URI-encoded, separators kept.
///
/// Segments that already carry percent-escapes (the resolver encodes `:` in
/// model ids as `%3A`) are encoded again, which is the form AWS verifies for
/// every service except S3.
pub fn canonical_uri(path: &str) -> String {
    if path.is_empty() || path == "/" {
        return "/".to_string();
    }
    path.split('/')
        .map(uri_encode)
        .collect::<Vec<_>>()
        .join("/")
}

/// Canonical query string: encoded pairs sorted by key then value.
pub fn canonical_query(url: &Url) -> String {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (uri_encode(&k), uri_encode(&v)))
        .collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Trim a header value and collapse runs of whitespace to single spaces.
fn canonical_header_value(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Sign a request and return the full header set to send, `authorization` included.
///
/// `headers` carries the request-specific headers (`content-type`, `accept`
/// and, for streaming, `x-amzn-bedrock-accept`); `host`, `x-amz-date`,
/// `x-amz-content-sha256` and `x-amz-security-token` are added here.
pub fn sign(
    method: &str,
    url: &str,
    headers: &BTreeMap<String, String>,
    body: &[u8],
    credentials: &Credentials,
    now: DateTime<Utc>,
) -> Result<SignedHeaders> {
    credentials.validate()?;

    let parsed =
        Url::parse(url).map_err(|e| GatewayError::Config(format!("invalid url {url}: {e}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| GatewayError::Config(format!("url has no host: {url}")))?;
    let host = match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = now.format("%Y%m%d").to_string();
    let payload_hash = sha256_hex(body);

    let mut signed: SignedHeaders = headers
        .iter()
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), canonical_header_value(v)))
        .collect();
    signed.insert("host".to_string(), host);
    signed.insert("x-amz-date".to_string(), amz_date.clone());
    signed.insert("x-amz-content-sha256".to_string(), payload_hash.clone());
    if let Some(token) = &credentials.session_token {
        signed.insert("x-amz-security-token".to_string(), token.clone());
    }

    let mut canonical_headers = String::new();
    for (k, v) in &signed {
        canonical_headers.push_str(k);
        canonical_headers.push(':');
        canonical_headers.push_str(v);
        canonical_headers.push('\n');
    }
    let signed_header_names = signed.keys().cloned().collect::<Vec<_>>().join(";");

    let canonical_request = format!(
        "{}\n{}\n{}\n{canonical_headers}\n{signed_header_names}\n{payload_hash}",
        method.trim().to_ascii_uppercase(),
        canonical_uri(parsed.path()),
        canonical_query(&parsed),
    );

    let credential_scope = format!(
        "{date_stamp}/{}/{SIGNING_SERVICE}/aws4_request",
        credentials.region
    );
    let string_to_sign = format!(
        "{ALGORITHM}\n{amz_date}\n{credential_scope}\n{}",
        sha256_hex(canonical_request.as_bytes())
    );

    let signing_key = derive_signing_key(
        &credentials.secret_access_key,
        &date_stamp,
        &credentials.region,
        SIGNING_SERVICE,
    )?;
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes())?);

    signed.insert(
        "authorization".to_string(),
        format!(
            "{ALGORITHM} Credential={}/{credential_scope},SignedHeaders={signed_header_names},Signature={signature}",
            credentials.access_key_id
        ),
    );
    Ok(signed)
}

/// Serialize `body` to JSON, then sign. Serialization failures surface as
/// `Encoding` before any signing work is done.
pub fn sign_json<T: Serialize + ?Sized>(
    method: &str,
    url: &str,
    headers: &BTreeMap<String, String>,
    body: &T,
    credentials: &Credentials,
    now: DateTime<Utc>,
) -> Result<(Vec<u8>, SignedHeaders)> {
    let bytes = serde_json::to_vec(body).map_err(|e| GatewayError::Encoding(e.to_string()))?;
    let signed = sign(method, url, headers, &bytes, credentials, now)?;
    Ok((bytes, signed))
}
