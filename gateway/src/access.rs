//! Access-grant gate for interactive viewers.
//!
//! Casual scrapers hitting the player page are routed through a
//! URL-shortener hop before the page renders; a viewer who completes the
//! hop once gets a signed cookie and skips the gate for its lifetime.
//! Media clients never reach this code (the handler redirects them to the
//! raw stream first), and any internal failure lets the viewer through:
//! a Redis or shortener outage must degrade to "no gate", never to a
//! hard block.
//!
//! State per viewer is one Redis key, `uuid:<fingerprint>`, holding the
//! UUID the viewer must bring back from the shortener, plus the
//! HMAC-signed `fsb_auth` cookie once the grant is proved.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::Cache;
use crate::config::{AUTH_COOKIE, Config};

/// Claims carried by the access cookie. Expiry is all we need: the cookie
/// proves "completed the shortener hop recently", not identity.
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    exp: u64,
}

/// What the player handler gives the gate about the incoming request.
pub struct GateRequest<'a> {
    pub client_ip: &'a str,
    pub user_agent: &'a str,
    pub host: &'a str,
    /// Path plus query, exactly as requested.
    pub request_uri: &'a str,
    pub uuid_param: Option<&'a str>,
    pub cookie: Option<&'a str>,
}

/// Gate decision for one request.
#[derive(Debug)]
pub enum GateOutcome {
    /// Render the page. `set_cookie` carries a freshly minted cookie when
    /// the viewer just proved a grant.
    Pass {
        just_verified: bool,
        set_cookie: Option<String>,
    },
    /// Send the viewer through the shortener.
    Redirect(String),
}

pub struct AccessGate {
    cache: Cache,
    http: reqwest::Client,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    jwt_expiration: u64,
    uuid_expiration: u64,
    shortner_url: String,
    shortner_api: String,
    scheme: &'static str,
    secure_cookies: bool,
}

#[derive(Serialize)]
struct ShortenRequest<'a> {
    url: &'a str,
}

#[derive(Deserialize)]
struct ShortenResponse {
    short_url: String,
}

impl AccessGate {
    pub fn new(cfg: &Config, cache: Cache, http: reqwest::Client) -> Self {
        let mut validation = Validation::default();
        validation.leeway = 0;
        Self {
            cache,
            http,
            encoding_key: EncodingKey::from_secret(cfg.jwt_secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(cfg.jwt_secret.as_bytes()),
            validation,
            jwt_expiration: cfg.jwt_expiration,
            uuid_expiration: cfg.uuid_expiration,
            shortner_url: cfg.shortner_url.clone(),
            shortner_api: cfg.shortner_api.clone(),
            scheme: cfg.scheme,
            secure_cookies: !cfg.is_local(),
        }
    }

    /// Run the grant state machine for one `/watch` request.
    pub async fn check(&self, req: GateRequest<'_>) -> GateOutcome {
        if let Some(token) = req.cookie
            && self.verify_jwt(token)
        {
            return GateOutcome::Pass {
                just_verified: false,
                set_cookie: None,
            };
        }
        info!("no valid access cookie");

        let key = format!("uuid:{}", fingerprint(req.client_ip, req.user_agent));

        if let (Some(stored), Some(claimed)) = (self.cache.get(&key).await, req.uuid_param)
            && stored == claimed
        {
            info!("access grant proved, minting cookie");
            match self.mint_jwt() {
                Ok(token) => {
                    self.cache.del(&key).await;
                    return GateOutcome::Pass {
                        just_verified: true,
                        set_cookie: Some(self.build_cookie(&token)),
                    };
                }
                Err(error) => {
                    warn!(error = %error, "cookie mint failed, letting viewer through");
                    return GateOutcome::Pass {
                        just_verified: false,
                        set_cookie: None,
                    };
                }
            }
        }

        let uuid = Uuid::new_v4().to_string();
        self.cache
            .set(&key, &uuid, Duration::from_secs(self.uuid_expiration))
            .await;

        let separator = if req.request_uri.contains('?') { "&" } else { "?" };
        let final_url = format!(
            "{}://{}{}{}uuid={}",
            self.scheme, req.host, req.request_uri, separator, uuid
        );
        match self.shorten(&final_url).await {
            Some(short_url) => {
                info!(url = %short_url, "redirecting viewer to shortener");
                GateOutcome::Redirect(short_url)
            }
            // Shortener down: let the viewer through rather than block them.
            None => GateOutcome::Pass {
                just_verified: false,
                set_cookie: None,
            },
        }
    }

    pub fn mint_jwt(&self) -> Result<String, jsonwebtoken::errors::Error> {
        let claims = Claims {
            exp: jsonwebtoken::get_current_timestamp() + self.jwt_expiration,
        };
        encode(&Header::default(), &claims, &self.encoding_key)
    }

    pub fn verify_jwt(&self, token: &str) -> bool {
        decode::<Claims>(token, &self.decoding_key, &self.validation).is_ok()
    }

    fn build_cookie(&self, token: &str) -> String {
        let mut cookie = format!(
            "{AUTH_COOKIE}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
            self.jwt_expiration
        );
        if self.secure_cookies {
            cookie.push_str("; Secure");
        }
        cookie
    }

    async fn shorten(&self, url: &str) -> Option<String> {
        if self.shortner_url.is_empty() {
            return None;
        }
        let response = match self
            .http
            .post(&self.shortner_url)
            .bearer_auth(&self.shortner_api)
            .json(&ShortenRequest { url })
            .send()
            .await
        {
            Ok(response) => response,
            Err(error) => {
                warn!(error = %error, "shortener request failed");
                return None;
            }
        };
        if !response.status().is_success() {
            warn!(status = %response.status(), "shortener returned an error");
            return None;
        }
        match response.json::<ShortenResponse>().await {
            Ok(body) => Some(body.short_url),
            Err(error) => {
                warn!(error = %error, "shortener response was not understood");
                None
            }
        }
    }
}

/// Client fingerprint the UUID grant is keyed by.
pub fn fingerprint(client_ip: &str, user_agent: &str) -> String {
    let digest = Sha256::digest(format!("{client_ip}:{user_agent}").as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Pull one cookie's value out of a `Cookie` request header.
pub fn cookie_value<'a>(raw: &'a str, name: &str) -> Option<&'a str> {
    raw.split(';').find_map(|part| {
        let (k, v) = part.trim().split_once('=')?;
        (k == name && !v.is_empty()).then_some(v)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_gate(jwt_expiration: u64) -> AccessGate {
        let secret = "test-secret";
        let mut validation = Validation::default();
        validation.leeway = 0;
        AccessGate {
            cache: test_cache(),
            http: reqwest::Client::new(),
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            jwt_expiration,
            uuid_expiration: 600,
            shortner_url: String::new(),
            shortner_api: String::new(),
            scheme: "https",
            secure_cookies: true,
        }
    }

    fn test_cache() -> Cache {
        // Pool creation does not touch the network; only command execution
        // does, and these tests never execute commands.
        let pool = deadpool_redis::Config::from_url("redis://127.0.0.1:1")
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .unwrap();
        Cache::from_pool(pool)
    }

    #[test]
    fn test_mint_then_verify_roundtrip() {
        let gate = test_gate(3600);
        let token = gate.mint_jwt().unwrap();
        assert!(gate.verify_jwt(&token));
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let gate = test_gate(3600);
        let expired = Claims {
            exp: jsonwebtoken::get_current_timestamp() - 10,
        };
        let token = encode(&Header::default(), &expired, &gate.encoding_key).unwrap();
        assert!(!gate.verify_jwt(&token));
    }

    #[test]
    fn test_token_from_other_secret_is_rejected() {
        let gate = test_gate(3600);
        let other = EncodingKey::from_secret(b"other-secret");
        let claims = Claims {
            exp: jsonwebtoken::get_current_timestamp() + 3600,
        };
        let token = encode(&Header::default(), &claims, &other).unwrap();
        assert!(!gate.verify_jwt(&token));
    }

    #[test]
    fn test_fingerprint_is_deterministic_and_input_sensitive() {
        let a = fingerprint("1.2.3.4", "Mozilla/5.0");
        assert_eq!(a, fingerprint("1.2.3.4", "Mozilla/5.0"));
        assert_ne!(a, fingerprint("1.2.3.5", "Mozilla/5.0"));
        assert_ne!(a, fingerprint("1.2.3.4", "curl/8.0"));
    }

    #[test]
    fn test_cookie_attributes() {
        let gate = test_gate(86400);
        let cookie = gate.build_cookie("tok");
        assert!(cookie.starts_with("fsb_auth=tok;"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Lax"));
        assert!(cookie.contains("Max-Age=86400"));
        assert!(cookie.contains("Secure"));
    }

    #[test]
    fn test_cookie_value_parsing() {
        let raw = "theme=dark; fsb_auth=abc.def.ghi; lang=en";
        assert_eq!(cookie_value(raw, "fsb_auth"), Some("abc.def.ghi"));
        assert_eq!(cookie_value(raw, "missing"), None);
        assert_eq!(cookie_value("fsb_auth=", "fsb_auth"), None);
    }
}
