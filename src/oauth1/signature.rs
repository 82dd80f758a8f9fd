//! OAuth 1.0a request signing (HMAC-SHA1, RFC 5849 section 3.4).

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{digest::InvalidLength, Hmac, Mac};
use rand::{distributions::Alphanumeric, Rng};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

const SIGNATURE_METHOD: &str = "HMAC-SHA1";
const OAUTH_VERSION: &str = "1.0";
const NONCE_LENGTH: usize = 32;

/// RFC 3986 percent-encoding: everything except `A-Z a-z 0-9 - . _ ~`.
pub fn percent_encode(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

/// Random alphanumeric nonce.
pub fn generate_nonce() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(NONCE_LENGTH)
        .map(char::from)
        .collect()
}

/// Builds the signature base string from the method, the base URL (no query) and every
/// request parameter (protocol, query and form parameters).
pub fn signature_base_string(method: &str, base_url: &str, params: &[(String, String)]) -> String {
    let mut encoded: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (percent_encode(k), percent_encode(v)))
        .collect();
    encoded.sort();

    let normalized = encoded
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    format!(
        "{}&{}&{}",
        method.to_ascii_uppercase(),
        percent_encode(base_url),
        percent_encode(&normalized)
    )
}

/// HMAC-SHA1 signature of `base_string`, base64-encoded.
pub fn sign(
    base_string: &str,
    consumer_secret: &str,
    token_secret: Option<&str>,
) -> Result<String, InvalidLength> {
    let key = format!(
        "{}&{}",
        percent_encode(consumer_secret),
        percent_encode(token_secret.unwrap_or(""))
    );
    let mut mac = HmacSha1::new_from_slice(key.as_bytes())?;
    mac.update(base_string.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// Token half of a signed request.
#[derive(Clone, Copy)]
pub struct TokenPair<'a> {
    pub token: &'a str,
    pub secret: &'a str,
}

/// Signs requests on behalf of one consumer (application).
pub struct Signer<'a> {
    pub consumer_key: &'a str,
    pub consumer_secret: &'a str,
}

impl Signer<'_> {
    /// Produces the `Authorization: OAuth ...` header value for a request.
    ///
    /// `extra` carries additional protocol parameters such as `oauth_callback` or
    /// `oauth_verifier`. Query parameters on `url` are included in the signature.
    pub fn authorization_header(
        &self,
        method: &str,
        url: &str,
        token: Option<TokenPair<'_>>,
        extra: &[(&str, &str)],
        nonce: &str,
        timestamp: i64,
    ) -> Result<String, InvalidLength> {
        let mut oauth_params: Vec<(String, String)> = vec![
            ("oauth_consumer_key".to_string(), self.consumer_key.to_string()),
            ("oauth_nonce".to_string(), nonce.to_string()),
            ("oauth_signature_method".to_string(), SIGNATURE_METHOD.to_string()),
            ("oauth_timestamp".to_string(), timestamp.to_string()),
            ("oauth_version".to_string(), OAUTH_VERSION.to_string()),
        ];
        if let Some(pair) = token {
            oauth_params.push(("oauth_token".to_string(), pair.token.to_string()));
        }
        for (k, v) in extra {
            oauth_params.push((k.to_string(), v.to_string()));
        }

        let (base_url, query) = match url.split_once('?') {
            Some((base, query)) => (base, query),
            None => (url, ""),
        };
        let mut signed_params = oauth_params.clone();
        signed_params.extend(
            serde_urlencoded::from_str::<Vec<(String, String)>>(query).unwrap_or_default(),
        );

        let base_string = signature_base_string(method, base_url, &signed_params);
        let signature = sign(
            &base_string,
            self.consumer_secret,
            token.map(|pair| pair.secret),
        )?;
        oauth_params.push(("oauth_signature".to_string(), signature));
        oauth_params.sort();

        let fields = oauth_params
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", percent_encode(k), percent_encode(v)))
            .collect::<Vec<_>>()
            .join(", ");

        Ok(format!("OAuth {}", fields))
    }
}
