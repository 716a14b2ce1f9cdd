use anyhow::{Context, Result, anyhow};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::client::GoogleClient;
use crate::discovery::Method;
use crate::token_store::{Token, TokenStore};

pub const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/auth";
pub const TOKEN_URL: &str = "https://accounts.google.com/o/oauth2/token";
pub const TOKEN_INFO_URL: &str = "https://www.googleapis.com/oauth2/v2/tokeninfo";
pub const REVOKE_URL: &str = "https://accounts.google.com/o/oauth2/revoke";
pub const OOB_REDIRECT_URL: &str = "urn:ietf:wg:oauth:2.0:oob";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: u64 = 3600;

/// Installed-application OAuth2 client settings.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_url: String,
    pub auth_url: String,
    pub token_url: String,
    pub token_info_url: String,
    pub revoke_url: String,
}

impl OAuthConfig {
    pub fn installed(client_id: String, client_secret: String) -> Self {
        Self {
            client_id,
            client_secret,
            redirect_url: OOB_REDIRECT_URL.to_string(),
            auth_url: AUTH_URL.to_string(),
            token_url: TOKEN_URL.to_string(),
            token_info_url: TOKEN_INFO_URL.to_string(),
            revoke_url: REVOKE_URL.to_string(),
        }
    }

    /// URL the user opens to grant `scope`; requests offline access so a refresh token is issued.
    pub fn auth_code_url(&self, scope: &str) -> String {
        let params = [
            ("access_type", "offline"),
            ("approval_prompt", "force"),
            ("client_id", self.client_id.as_str()),
            ("redirect_uri", self.redirect_url.as_str()),
            ("response_type", "code"),
            ("scope", scope),
        ];
        let query: Vec<String> = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect();
        format!("{}?{}", self.auth_url, query.join("&"))
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct TokenInfo {
    pub scope: String,
    pub expires_in: i64,
}

impl TokenInfo {
    pub fn expired(&self) -> bool {
        self.expires_in < 0
    }
}

/// Space-joined scopes, or `None` for methods callable without authorization.
pub fn scope_string(method: &Method) -> Option<String> {
    if method.scopes.is_empty() {
        None
    } else {
        Some(method.scopes.join(" "))
    }
}

pub fn exchange_code(client: &GoogleClient, oauth: &OAuthConfig, code: &str) -> Result<Token> {
    let resp: TokenResponse = client
        .post_form(
            &oauth.token_url,
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("client_id", oauth.client_id.as_str()),
                ("client_secret", oauth.client_secret.as_str()),
                ("redirect_uri", oauth.redirect_url.as_str()),
            ],
        )
        .context("error exchanging code")?;
    Ok(Token {
        access_token: resp.access_token,
        refresh_token: resp.refresh_token.unwrap_or_default(),
    })
}

pub fn token_info(
    client: &GoogleClient,
    oauth: &OAuthConfig,
    access_token: &str,
) -> Result<TokenInfo> {
    let url = format!(
        "{}?access_token={}",
        oauth.token_info_url,
        urlencoding::encode(access_token)
    );
    client.post_empty(&url).context("error getting tokeninfo")
}

/// Exchanges an authorization code and records the token under the scope the
/// provider reports for it, which may differ from the scope originally requested.
pub fn finish(
    client: &GoogleClient,
    oauth: &OAuthConfig,
    store: &mut TokenStore,
    code: &str,
) -> Result<String> {
    let token = exchange_code(client, oauth, code)?;
    let info = token_info(client, oauth, &token.access_token)?;
    if info.scope.is_empty() {
        return Err(anyhow!("tokeninfo returned no scope"));
    }
    if info.expired() {
        log::warn!("token for scope {:?} is already expired", info.scope);
    }
    log::debug!("token granted for scope {:?}", info.scope);
    store.insert(info.scope.clone(), token);
    Ok(info.scope)
}

/// Revokes the stored token for `scope`. Returns false when nothing was stored.
pub fn revoke(
    client: &GoogleClient,
    oauth: &OAuthConfig,
    store: &mut TokenStore,
    scope: &str,
) -> Result<bool> {
    let Some(token) = store.get(scope) else {
        return Ok(false);
    };
    // revoking the refresh token also invalidates its access tokens
    let secret = if token.refresh_token.is_empty() {
        &token.access_token
    } else {
        &token.refresh_token
    };
    let url = format!("{}?token={}", oauth.revoke_url, urlencoding::encode(secret));
    let status = client.get_status(&url).context("error revoking token")?;
    if !status.is_success() {
        return Err(anyhow!("error revoking token: http {}", status));
    }
    store.remove(scope);
    Ok(true)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAccount {
    pub client_email: String,
    pub token_uri: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct SecretsSection {
    client_email: Option<String>,
    token_uri: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ClientSecrets {
    web: Option<SecretsSection>,
    client_email: Option<String>,
    token_uri: Option<String>,
}

/// Reads the client email and token endpoint from a client-secrets file,
/// either from its `web` section or a top-level service-account key.
pub fn read_service_account(path: &Path) -> Result<ServiceAccount> {
    let raw = fs::read(path)
        .with_context(|| format!("error reading secrets file {}", path.display()))?;
    let secrets: ClientSecrets =
        serde_json::from_slice(&raw).context("error unmarshalling secrets")?;

    let (email, token_uri) = match secrets.web {
        Some(web) => (web.client_email, web.token_uri),
        None => (secrets.client_email, secrets.token_uri),
    };
    let client_email = email
        .filter(|v| !v.is_empty())
        .ok_or_else(|| anyhow!("secrets file {} has no client_email", path.display()))?;
    Ok(ServiceAccount {
        client_email,
        token_uri: token_uri
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| TOKEN_URL.to_string()),
    })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AssertionClaims {
    pub iss: String,
    pub scope: String,
    pub aud: String,
    pub exp: u64,
    pub iat: u64,
}

pub fn sign_assertion(
    account: &ServiceAccount,
    scope: &str,
    pem: &[u8],
    now: u64,
) -> Result<String> {
    let key = EncodingKey::from_rsa_pem(pem).context("error parsing private key")?;
    let claims = AssertionClaims {
        iss: account.client_email.clone(),
        scope: scope.to_string(),
        aud: account.token_uri.clone(),
        exp: now + ASSERTION_LIFETIME_SECS,
        iat: now,
    };
    jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
        .context("error signing assertion")
}

/// Obtains a one-off access token for `scope` with a signed JWT assertion.
pub fn service_account_token(
    client: &GoogleClient,
    pem_path: &Path,
    secrets_path: &Path,
    scope: &str,
) -> Result<String> {
    let account = read_service_account(secrets_path)?;
    let pem = fs::read(pem_path)
        .with_context(|| format!("error reading private key file {}", pem_path.display()))?;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock before unix epoch")?
        .as_secs();
    let assertion = sign_assertion(&account, scope, &pem, now)?;

    let resp: TokenResponse = client
        .post_form(
            &account.token_uri,
            &[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())],
        )
        .context("assertion error")?;
    Ok(resp.access_token)
}

/// Credential-related flags for a single API call.
#[derive(Debug, Default, Clone)]
pub struct MetaCredentials {
    pub pem: Option<PathBuf>,
    pub secrets: Option<PathBuf>,
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// The method declares no scopes.
    Anonymous,
    Bearer(String),
    /// Scopes are required but no token is available.
    Unauthorized { scope: String },
}

impl Credential {
    pub fn bearer(&self) -> Option<&str> {
        match self {
            Credential::Bearer(token) => Some(token.as_str()),
            _ => None,
        }
    }
}

/// Picks the credential for a call: explicit token, then service account,
/// then the token store.
pub fn resolve(
    client: &GoogleClient,
    method: &Method,
    meta: &MetaCredentials,
    store: &TokenStore,
) -> Result<Credential> {
    if let Some(token) = &meta.token {
        return Ok(Credential::Bearer(token.clone()));
    }
    let Some(scope) = scope_string(method) else {
        return Ok(Credential::Anonymous);
    };

    if let (Some(pem), Some(secrets)) = (&meta.pem, &meta.secrets) {
        log::debug!("using service account for scope {:?}", scope);
        let token = service_account_token(client, pem, secrets, &scope)?;
        return Ok(Credential::Bearer(token));
    }

    match store.get(&scope) {
        Some(token) => Ok(Credential::Bearer(token.access_token.clone())),
        None => Ok(Credential::Unauthorized { scope }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{DecodingKey, Validation};
    use std::io::Write;

    const TEST_KEY: &[u8] = include_bytes!("../testdata/service_account.pem");
    const TEST_PUBLIC_KEY: &[u8] = include_bytes!("../testdata/service_account.pub.pem");

    fn oauth_for(server: &mockito::Server) -> OAuthConfig {
        let mut oauth = OAuthConfig::installed("cid".to_string(), "csecret".to_string());
        oauth.token_url = format!("{}/o/oauth2/token", server.url());
        oauth.token_info_url = format!("{}/oauth2/v2/tokeninfo", server.url());
        oauth.revoke_url = format!("{}/o/oauth2/revoke", server.url());
        oauth
    }

    fn scoped_method(scopes: &[&str]) -> Method {
        Method {
            id: "calendar.events.list".to_string(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            ..Method::default()
        }
    }

    fn write_file(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        file
    }

    #[test]
    fn auth_code_url_carries_scope_and_client() {
        let oauth = OAuthConfig::installed("cid".to_string(), "s".to_string());
        let url = oauth.auth_code_url("a b");
        assert!(url.starts_with("https://accounts.google.com/o/oauth2/auth?"));
        assert!(url.contains("client_id=cid"));
        assert!(url.contains("scope=a%20b"));
        assert!(url.contains("access_type=offline"));
        assert!(url.contains("redirect_uri=urn%3Aietf%3Awg%3Aoauth%3A2.0%3Aoob"));
    }

    #[test]
    fn finish_stores_token_under_granted_scope() {
        let mut server = mockito::Server::new();
        let exchange = server
            .mock("POST", "/o/oauth2/token")
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
                mockito::Matcher::UrlEncoded("code".into(), "the-code".into()),
                mockito::Matcher::UrlEncoded("client_id".into(), "cid".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"access_token":"at","refresh_token":"rt","expires_in":3600}"#)
            .create();
        let info = server
            .mock("POST", "/oauth2/v2/tokeninfo")
            .match_query(mockito::Matcher::UrlEncoded("access_token".into(), "at".into()))
            .with_status(200)
            .with_body(r#"{"scope":"https://x/auth/b https://x/auth/a","expires_in":3599}"#)
            .create();

        let client = GoogleClient::new(server.url(), None).unwrap();
        let oauth = oauth_for(&server);
        let mut store = TokenStore::default();
        let scope = finish(&client, &oauth, &mut store, "the-code").unwrap();

        assert_eq!(scope, "https://x/auth/b https://x/auth/a");
        assert_eq!(
            store.get(&scope),
            Some(&Token {
                access_token: "at".to_string(),
                refresh_token: "rt".to_string()
            })
        );
        exchange.assert();
        info.assert();
    }

    #[test]
    fn finish_fails_on_rejected_code() {
        let mut server = mockito::Server::new();
        let _exchange = server
            .mock("POST", "/o/oauth2/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant"}"#)
            .create();

        let client = GoogleClient::new(server.url(), None).unwrap();
        let mut store = TokenStore::default();
        assert!(finish(&client, &oauth_for(&server), &mut store, "bad").is_err());
        assert!(store.tokens.is_empty());
    }

    #[test]
    fn revoke_removes_entry_on_success() {
        let mut server = mockito::Server::new();
        let revoke_mock = server
            .mock("GET", "/o/oauth2/revoke")
            .match_query(mockito::Matcher::UrlEncoded("token".into(), "rt".into()))
            .with_status(200)
            .create();

        let client = GoogleClient::new(server.url(), None).unwrap();
        let mut store = TokenStore::default();
        store.insert(
            "s".to_string(),
            Token {
                access_token: "at".to_string(),
                refresh_token: "rt".to_string(),
            },
        );
        assert!(revoke(&client, &oauth_for(&server), &mut store, "s").unwrap());
        assert!(store.get("s").is_none());
        revoke_mock.assert();

        assert!(!revoke(&client, &oauth_for(&server), &mut store, "s").unwrap());
    }

    #[test]
    fn revoke_keeps_entry_when_provider_refuses() {
        let mut server = mockito::Server::new();
        let _revoke = server
            .mock("GET", "/o/oauth2/revoke")
            .match_query(mockito::Matcher::Any)
            .with_status(400)
            .create();

        let client = GoogleClient::new(server.url(), None).unwrap();
        let mut store = TokenStore::default();
        store.insert(
            "s".to_string(),
            Token {
                access_token: "at".to_string(),
                refresh_token: String::new(),
            },
        );
        assert!(revoke(&client, &oauth_for(&server), &mut store, "s").is_err());
        assert!(store.get("s").is_some());
    }

    #[test]
    fn read_service_account_accepts_web_and_top_level() {
        let web = write_file(br#"{"web":{"client_email":"svc@x","token_uri":"https://t/token"}}"#);
        assert_eq!(
            read_service_account(web.path()).unwrap(),
            ServiceAccount {
                client_email: "svc@x".to_string(),
                token_uri: "https://t/token".to_string()
            }
        );

        let top = write_file(br#"{"type":"service_account","client_email":"svc@y"}"#);
        let account = read_service_account(top.path()).unwrap();
        assert_eq!(account.client_email, "svc@y");
        assert_eq!(account.token_uri, TOKEN_URL);

        let missing = write_file(br#"{"web":{}}"#);
        assert!(read_service_account(missing.path()).is_err());
    }

    #[test]
    fn sign_assertion_produces_verifiable_rs256_jwt() {
        let account = ServiceAccount {
            client_email: "svc@x".to_string(),
            token_uri: "https://t/token".to_string(),
        };
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        let jwt = sign_assertion(&account, "s1 s2", TEST_KEY, now).unwrap();

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&["https://t/token"]);
        let decoded = jsonwebtoken::decode::<AssertionClaims>(
            &jwt,
            &DecodingKey::from_rsa_pem(TEST_PUBLIC_KEY).unwrap(),
            &validation,
        )
        .unwrap();
        assert_eq!(decoded.claims.iss, "svc@x");
        assert_eq!(decoded.claims.scope, "s1 s2");
        assert_eq!(decoded.claims.exp, now + ASSERTION_LIFETIME_SECS);
    }

    #[test]
    fn resolve_prefers_explicit_token() {
        let client = GoogleClient::new("http://127.0.0.1:9".to_string(), None).unwrap();
        let meta = MetaCredentials {
            token: Some("given".to_string()),
            ..MetaCredentials::default()
        };
        let cred = resolve(&client, &scoped_method(&[]), &meta, &TokenStore::default()).unwrap();
        assert_eq!(cred, Credential::Bearer("given".to_string()));
    }

    #[test]
    fn resolve_without_scopes_is_anonymous() {
        let client = GoogleClient::new("http://127.0.0.1:9".to_string(), None).unwrap();
        let cred = resolve(
            &client,
            &scoped_method(&[]),
            &MetaCredentials::default(),
            &TokenStore::default(),
        )
        .unwrap();
        assert_eq!(cred, Credential::Anonymous);
        assert_eq!(cred.bearer(), None);
    }

    #[test]
    fn resolve_uses_store_or_reports_unauthorized() {
        let client = GoogleClient::new("http://127.0.0.1:9".to_string(), None).unwrap();
        let method = scoped_method(&["cal.read", "cal.write"]);
        let mut store = TokenStore::default();

        let cred = resolve(&client, &method, &MetaCredentials::default(), &store).unwrap();
        assert_eq!(
            cred,
            Credential::Unauthorized {
                scope: "cal.read cal.write".to_string()
            }
        );

        store.insert(
            "cal.read cal.write".to_string(),
            Token {
                access_token: "stored".to_string(),
                refresh_token: String::new(),
            },
        );
        let cred = resolve(&client, &method, &MetaCredentials::default(), &store).unwrap();
        assert_eq!(cred.bearer(), Some("stored"));
    }

    #[test]
    fn resolve_exchanges_service_account_assertion() {
        let mut server = mockito::Server::new();
        let token_mock = server
            .mock("POST", "/token")
            .match_body(mockito::Matcher::UrlEncoded(
                "grant_type".into(),
                JWT_BEARER_GRANT.into(),
            ))
            .with_status(200)
            .with_body(r#"{"access_token":"svc-token","token_type":"Bearer","expires_in":3600}"#)
            .create();

        let secrets = write_file(
            format!(
                r#"{{"web":{{"client_email":"svc@x","token_uri":"{}/token"}}}}"#,
                server.url()
            )
            .as_bytes(),
        );
        let pem = write_file(TEST_KEY);
        let meta = MetaCredentials {
            pem: Some(pem.path().to_path_buf()),
            secrets: Some(secrets.path().to_path_buf()),
            token: None,
        };

        let client = GoogleClient::new(server.url(), None).unwrap();
        let mut store = TokenStore::default();
        store.insert(
            "cal.read".to_string(),
            Token {
                access_token: "stored".to_string(),
                refresh_token: String::new(),
            },
        );
        let cred = resolve(&client, &scoped_method(&["cal.read"]), &meta, &store).unwrap();
        assert_eq!(cred, Credential::Bearer("svc-token".to_string()));
        token_mock.assert();
    }
}
