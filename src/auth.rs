//! Credential resolution for the Sheets API.
//!
//! A [`CredentialProvider`] turns a client-secret file and a cached token file
//! into a usable access token. The default provider, [`InstalledAppFlow`],
//! reuses a cached token when it is still valid, refreshes it when it has
//! expired, and falls back to the browser consent flow for desktop apps.
//!
//! The resulting [`Credential`] is wrapped in an [`AuthContext`] once, before
//! any export job starts, and shared read-only by every job in the batch.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use rand::Rng as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::error::{AppError, Result};

/// Read-only access to spreadsheets and their values.
pub const SHEETS_READONLY_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets.readonly";

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// How long the loopback server waits for the browser redirect.
const CONSENT_TIMEOUT: Duration = Duration::from_secs(300);

/// Tokens are treated as expired this long before their real expiry.
const EXPIRY_SKEW_SECS: i64 = 60;

/// Random bytes behind a PKCE verifier; 32 encode to 43 characters.
const CODE_VERIFIER_BYTES: usize = 32;
const STATE_BYTES: usize = 16;

/// An access token authorizing Sheets API calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            expires_at: None,
        }
    }
}

/// Authorization shared by every job of a batch.
///
/// Cloning is cheap; all clones point at the same credential.
#[derive(Debug, Clone)]
pub struct AuthContext {
    credential: Arc<Credential>,
}

impl AuthContext {
    pub fn new(credential: Credential) -> Self {
        Self {
            credential: Arc::new(credential),
        }
    }

    /// Resolves a credential through `provider` and wraps it.
    pub async fn obtain(provider: &dyn CredentialProvider) -> Result<Self> {
        let credential = provider.obtain_credential().await?;
        Ok(Self::new(credential))
    }

    pub fn access_token(&self) -> &str {
        &self.credential.access_token
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }
}

/// Source of API credentials.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Returns a valid credential or fails with [`AppError::Auth`].
    async fn obtain_credential(&self) -> Result<Credential>;
}

/// OAuth client registration, as downloaded from the Google Cloud Console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSecret {
    pub client_id: String,
    pub client_secret: String,
    pub auth_uri: String,
    pub token_uri: String,
}

#[derive(Debug, Deserialize)]
struct ClientSecretFile {
    installed: Option<ClientSecretSection>,
    web: Option<ClientSecretSection>,
    client_id: Option<String>,
    client_secret: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClientSecretSection {
    client_id: String,
    client_secret: String,
    auth_uri: Option<String>,
    token_uri: Option<String>,
}

impl ClientSecret {
    /// Loads a client secret from a JSON file.
    ///
    /// # Errors
    /// Returns [`AppError::Auth`] if the file is missing, unreadable, or
    /// contains neither an `installed`/`web` section nor flat client fields.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            AppError::Auth(format!(
                "cannot read client secret file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let file: ClientSecretFile = serde_json::from_str(json)
            .map_err(|e| AppError::Auth(format!("invalid client secret file: {}", e)))?;

        if let Some(section) = file.installed.or(file.web) {
            return Ok(Self {
                client_id: section.client_id,
                client_secret: section.client_secret,
                auth_uri: section.auth_uri.unwrap_or_else(|| GOOGLE_AUTH_URL.to_string()),
                token_uri: section
                    .token_uri
                    .unwrap_or_else(|| GOOGLE_TOKEN_URL.to_string()),
            });
        }

        match (file.client_id, file.client_secret) {
            (Some(client_id), Some(client_secret)) => Ok(Self {
                client_id,
                client_secret,
                auth_uri: GOOGLE_AUTH_URL.to_string(),
                token_uri: GOOGLE_TOKEN_URL.to_string(),
            }),
            _ => Err(AppError::Auth(
                "client secret file has no 'installed', 'web' or client_id/client_secret fields"
                    .to_string(),
            )),
        }
    }
}

/// Cached OAuth token set.
///
/// Also reads the `token`/`expiry` field names written by Google's Python
/// client libraries, so an existing `token.json` keeps working.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenInfo {
    #[serde(alias = "token")]
    pub access_token: String,

    #[serde(default)]
    pub refresh_token: Option<String>,

    #[serde(default, alias = "expiry")]
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub scopes: Vec<String>,
}

impl TokenInfo {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_in_secs: Option<i64>,
        scopes: Vec<String>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
            expires_at: expires_in_secs.map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
            scopes,
        }
    }

    /// Returns true if the token is expired or about to expire.
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => {
                Utc::now() + chrono::Duration::seconds(EXPIRY_SKEW_SECS) >= expires_at
            }
            None => false,
        }
    }

    /// Returns true if the token grants every scope in `required`.
    ///
    /// Tokens that do not record their scopes are accepted.
    pub fn has_scopes(&self, required: &[String]) -> bool {
        self.scopes.is_empty() || required.iter().all(|scope| self.scopes.contains(scope))
    }

    pub fn credential(&self) -> Credential {
        Credential {
            access_token: self.access_token.clone(),
            expires_at: self.expires_at,
        }
    }
}

/// File-backed token cache.
#[derive(Debug, Clone)]
pub struct TokenCache {
    path: PathBuf,
}

impl TokenCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the cached token, if any.
    ///
    /// A missing or unparseable file yields `None`; the latter is logged.
    pub fn load(&self) -> Option<TokenInfo> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(_) => {
                debug!("no token cache at {:?}", self.path);
                return None;
            }
        };

        match serde_json::from_str(&content) {
            Ok(token) => {
                debug!("loaded cached token from {:?}", self.path);
                Some(token)
            }
            Err(e) => {
                warn!("ignoring unreadable token cache {:?}: {}", self.path, e);
                None
            }
        }
    }

    /// Writes the token atomically, readable only by the owner on Unix.
    pub fn save(&self, token: &TokenInfo) -> Result<()> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)?;

        let mut file = tempfile::NamedTempFile::new_in(&parent)?;
        file.write_all(serde_json::to_string_pretty(token)?.as_bytes())?;
        file.flush()?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.as_file()
                .set_permissions(fs::Permissions::from_mode(0o600))?;
        }

        file.persist(&self.path).map_err(|e| AppError::Io(e.error))?;
        debug!("saved token to {:?}", self.path);
        Ok(())
    }

    /// Removes the cached token. Returns true if a file was deleted.
    pub fn clear(&self) -> Result<bool> {
        if !self.path.exists() {
            return Ok(false);
        }
        fs::remove_file(&self.path)?;
        info!("removed cached token {:?}", self.path);
        Ok(true)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

/// Installed-application OAuth flow backed by local files.
///
/// # Resolution order
/// 1. A cached, unexpired token with the required scopes
/// 2. A refresh of an expired cached token
/// 3. Browser consent through a loopback redirect (if `interactive`)
pub struct InstalledAppFlow {
    client_secret_path: PathBuf,
    cache: TokenCache,
    scopes: Vec<String>,
    interactive: bool,
    http: reqwest::Client,
}

impl InstalledAppFlow {
    pub fn new(client_secret_path: impl Into<PathBuf>, token_path: impl Into<PathBuf>) -> Self {
        Self {
            client_secret_path: client_secret_path.into(),
            cache: TokenCache::new(token_path),
            scopes: vec![SHEETS_READONLY_SCOPE.to_string()],
            interactive: true,
            http: reqwest::Client::new(),
        }
    }

    /// Disables the browser consent fallback.
    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(self)
    }

    pub fn cache(&self) -> &TokenCache {
        &self.cache
    }

    async fn refresh(&self, secret: &ClientSecret, refresh_token: &str) -> Result<TokenResponse> {
        let params = [
            ("client_id", secret.client_id.as_str()),
            ("client_secret", secret.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];
        self.token_request(&secret.token_uri, &params).await
    }

    async fn exchange_code(
        &self,
        secret: &ClientSecret,
        code: &str,
        verifier: &str,
        redirect_uri: &str,
    ) -> Result<TokenInfo> {
        let params = [
            ("client_id", secret.client_id.as_str()),
            ("client_secret", secret.client_secret.as_str()),
            ("code", code),
            ("code_verifier", verifier),
            ("grant_type", "authorization_code"),
            ("redirect_uri", redirect_uri),
        ];
        let response = self.token_request(&secret.token_uri, &params).await?;

        let scopes = match response.scope {
            Some(ref granted) => granted.split_whitespace().map(str::to_string).collect(),
            None => self.scopes.clone(),
        };
        Ok(TokenInfo::new(
            response.access_token,
            response.refresh_token,
            response.expires_in,
            scopes,
        ))
    }

    async fn token_request(&self, token_uri: &str, params: &[(&str, &str)]) -> Result<TokenResponse> {
        let response = self
            .http
            .post(token_uri)
            .form(params)
            .send()
            .await
            .map_err(|e| AppError::Transport(format!("token request failed: {}", e)))?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(AppError::Auth(format!(
                "token endpoint returned {}: {}",
                status, body
            )));
        }

        serde_json::from_str(&body)
            .map_err(|e| AppError::Auth(format!("invalid token response: {}", e)))
    }

    #[instrument(skip(self, secret))]
    async fn consent(&self, secret: &ClientSecret) -> Result<TokenInfo> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let redirect_uri = format!("http://127.0.0.1:{}/callback", port);
        let pkce = Pkce::new();
        let auth_url = build_auth_url(secret, &redirect_uri, &self.scopes, &pkce)?;

        info!("opening browser for Google consent");
        if let Err(e) = open::that(auth_url.as_str()) {
            warn!("failed to open browser: {}", e);
            eprintln!("\nOpen this URL in your browser to continue:\n\n{}\n", auth_url);
        }

        let code = tokio::time::timeout(CONSENT_TIMEOUT, wait_for_code(&listener, &pkce.state))
            .await
            .map_err(|_| AppError::Auth("timed out waiting for browser consent".to_string()))??;

        info!("received authorization code, exchanging for tokens");
        self.exchange_code(secret, &code, &pkce.verifier, &redirect_uri)
            .await
    }
}

#[async_trait]
impl CredentialProvider for InstalledAppFlow {
    #[instrument(skip(self))]
    async fn obtain_credential(&self) -> Result<Credential> {
        let secret = ClientSecret::from_file(&self.client_secret_path)?;

        if let Some(mut token) = self.cache.load() {
            if token.has_scopes(&self.scopes) {
                if !token.is_expired() {
                    debug!("using cached token");
                    return Ok(token.credential());
                }

                if let Some(refresh_token) = token.refresh_token.clone() {
                    match self.refresh(&secret, &refresh_token).await {
                        Ok(response) => {
                            token.access_token = response.access_token;
                            token.expires_at = response
                                .expires_in
                                .map(|secs| Utc::now() + chrono::Duration::seconds(secs));
                            if response.refresh_token.is_some() {
                                token.refresh_token = response.refresh_token;
                            }
                            self.cache.save(&token)?;
                            info!("refreshed expired access token");
                            return Ok(token.credential());
                        }
                        Err(e) => warn!("token refresh failed: {}", e),
                    }
                }
            } else {
                info!("cached token lacks required scopes");
            }
        }

        if !self.interactive {
            return Err(AppError::Auth(format!(
                "no valid cached token at {}; run `gsheet-export auth login`",
                self.cache.path().display()
            )));
        }

        let token = self.consent(&secret).await?;
        self.cache.save(&token)?;
        Ok(token.credential())
    }
}

/// Per-consent PKCE verifier and challenge, plus the anti-forgery `state`.
#[derive(Debug, Clone)]
pub struct Pkce {
    pub verifier: String,
    /// Base64url SHA-256 of `verifier`, sent with method `S256`.
    pub challenge: String,
    pub state: String,
}

impl Pkce {
    pub fn new() -> Self {
        let verifier = random_token(CODE_VERIFIER_BYTES);
        Self {
            challenge: Self::challenge_for(&verifier),
            verifier,
            state: random_token(STATE_BYTES),
        }
    }

    pub fn challenge_for(verifier: &str) -> String {
        URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
    }
}

impl Default for Pkce {
    fn default() -> Self {
        Self::new()
    }
}

fn random_token(len: usize) -> String {
    let mut rng = rand::rng();
    let bytes: Vec<u8> = (0..len).map(|_| rng.random()).collect();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Builds the consent page URL for the installed-app flow.
pub fn build_auth_url(
    secret: &ClientSecret,
    redirect_uri: &str,
    scopes: &[String],
    pkce: &Pkce,
) -> Result<Url> {
    let scope = scopes.join(" ");
    let url = Url::parse_with_params(
        &secret.auth_uri,
        &[
            ("client_id", secret.client_id.as_str()),
            ("redirect_uri", redirect_uri),
            ("response_type", "code"),
            ("scope", scope.as_str()),
            ("code_challenge", pkce.challenge.as_str()),
            ("code_challenge_method", "S256"),
            ("state", pkce.state.as_str()),
            ("access_type", "offline"),
            ("prompt", "consent"),
        ],
    )?;
    Ok(url)
}

/// Accepts loopback connections until one carries the OAuth redirect.
async fn wait_for_code(listener: &TcpListener, expected_state: &str) -> Result<String> {
    loop {
        let (stream, _) = listener.accept().await?;
        let mut reader = BufReader::new(stream);
        let mut request_line = String::new();
        if reader.read_line(&mut request_line).await.is_err() {
            continue;
        }

        let Some(outcome) = parse_callback(&request_line, expected_state) else {
            continue;
        };

        let page = match &outcome {
            Ok(_) => "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nConnection: close\r\n\r\n\
                <html><body><h1>Authorization complete</h1>\
                <p>You can close this window.</p></body></html>",
            Err(_) => "HTTP/1.1 400 Bad Request\r\nContent-Type: text/html\r\nConnection: close\r\n\r\n\
                <html><body><h1>Authorization failed</h1>\
                <p>You can close this window.</p></body></html>",
        };
        let mut stream = reader.into_inner();
        let _ = stream.write_all(page.as_bytes()).await;
        let _ = stream.shutdown().await;

        return outcome;
    }
}

/// Parses `GET /callback?code=...&state=... HTTP/1.1`.
///
/// Returns `None` for requests that are not the redirect (favicon etc.).
/// A code is only accepted alongside the `state` sent with the consent URL.
fn parse_callback(request_line: &str, expected_state: &str) -> Option<Result<String>> {
    let mut parts = request_line.split_whitespace();
    if parts.next() != Some("GET") {
        return None;
    }
    let target = parts.next()?;
    if !target.starts_with("/callback") {
        return None;
    }

    let url = Url::parse(&format!("http://127.0.0.1{}", target)).ok()?;
    let mut code = None;
    let mut state = None;
    let mut error = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            "error" => error = Some(value.into_owned()),
            _ => {}
        }
    }

    Some(match (code, error) {
        (_, Some(error)) => Err(AppError::Auth(format!("authorization denied: {}", error))),
        (Some(_), None) if state.as_deref() != Some(expected_state) => Err(AppError::Auth(
            "authorization redirect carried the wrong state".to_string(),
        )),
        (Some(code), None) => Ok(code),
        (None, None) => Err(AppError::Auth(
            "authorization redirect carried no code".to_string(),
        )),
    })
}
