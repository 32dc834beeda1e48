//! AWS Signature Version 4 for unsigned-payload GET requests against
//! S3-compatible endpoints (S3, MinIO, GCS interoperability).

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::credentials::AccessKeys;

type HmacSha256 = Hmac<Sha256>;

const EMPTY_PAYLOAD_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(m) => m,
        Err(_) => return Vec::new(),
    };
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// RFC 3986 encoding as SigV4 expects: everything but unreserved characters.
pub fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for b in input.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            b'/' if !encode_slash => out.push('/'),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Signing key for one day, region and service.
pub fn signing_key(secret_key: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac(format!("AWS4{secret_key}").as_bytes(), date.as_bytes());
    let k_region = hmac(&k_date, region.as_bytes());
    let k_service = hmac(&k_region, service.as_bytes());
    hmac(&k_service, b"aws4_request")
}

pub struct Signer<'a> {
    pub keys: &'a AccessKeys,
    pub region: &'a str,
    pub service: &'a str,
}

impl Signer<'_> {
    /// Headers to attach to a GET of `host` + `canonical_path` + `query`.
    ///
    /// `canonical_path` must already be encoded with [`uri_encode`]; `query` pairs are raw and
    /// get encoded and sorted here. The caller must send the query in the same encoding.
    pub fn sign_get(&self, host: &str, canonical_path: &str, query: &[(String, String)], now: DateTime<Utc>) -> Vec<(String, String)> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();

        let canonical_query = canonical_query(query);
        let mut headers: Vec<(String, String)> = vec![
            ("host".to_string(), host.to_string()),
            ("x-amz-content-sha256".to_string(), EMPTY_PAYLOAD_SHA256.to_string()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(token) = &self.keys.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort();
        let canonical_headers: String = headers.iter().map(|(k, v)| format!("{k}:{}\n", v.trim())).collect();
        let signed_headers = headers.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>().join(";");

        let canonical_request = format!(
            "GET\n{canonical_path}\n{canonical_query}\n{canonical_headers}\n{signed_headers}\n{EMPTY_PAYLOAD_SHA256}"
        );
        let scope = format!("{date}/{}/{}/aws4_request", self.region, self.service);
        let string_to_sign = format!("AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}", sha256_hex(canonical_request.as_bytes()));
        let key = signing_key(&self.keys.secret_key, &date, self.region, self.service);
        let signature = hex::encode(hmac(&key, string_to_sign.as_bytes()));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            self.keys.access_key
        );
        let mut out: Vec<(String, String)> = headers.into_iter().filter(|(k, _)| k != "host").collect();
        out.push(("authorization".to_string(), authorization));
        out
    }
}

/// Sorted `k=v&k=v` with both sides encoded.
pub fn canonical_query(query: &[(String, String)]) -> String {
    let mut pairs: Vec<(String, String)> = query.iter().map(|(k, v)| (uri_encode(k, true), uri_encode(v, true))).collect();
    pairs.sort();
    pairs.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join("&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn derives_documented_signing_key() {
        let key = signing_key("wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY", "20120215", "us-east-1", "iam");
        assert_eq!(hex::encode(key), "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d");
    }

    #[test]
    fn encodes_reserved_characters() {
        assert_eq!(uri_encode("functions/hello (1)/main.py", false), "functions/hello%20%281%29/main.py");
        assert_eq!(uri_encode("a/b", true), "a%2Fb");
        assert_eq!(uri_encode("it's*", false), "it%27s%2A");
        let q = vec![("prefix".to_string(), "fns/".to_string()), ("list-type".to_string(), "2".to_string())];
        assert_eq!(canonical_query(&q), "list-type=2&prefix=fns%2F");
    }

    #[test]
    fn signature_is_stable_and_scoped() {
        let keys = AccessKeys { access_key: "AKIDEXAMPLE".into(), secret_key: "secret".into(), session_token: None };
        let signer = Signer { keys: &keys, region: "us-east-1", service: "s3" };
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().unwrap_or_else(Utc::now);
        let a = signer.sign_get("bucket.s3.amazonaws.com", "/main.py", &[], now);
        let b = signer.sign_get("bucket.s3.amazonaws.com", "/main.py", &[], now);
        assert_eq!(a, b);
        let auth = a.iter().find(|(k, _)| k == "authorization").map(|(_, v)| v.clone()).unwrap_or_default();
        assert!(auth.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20240501/us-east-1/s3/aws4_request"));
        assert!(auth.contains("SignedHeaders=host;x-amz-content-sha256;x-amz-date"));
        assert!(a.iter().any(|(k, v)| k == "x-amz-date" && v == "20240501T120000Z"));
        let c = signer.sign_get("bucket.s3.amazonaws.com", "/other.py", &[], now);
        assert_ne!(a, c);
    }
}
