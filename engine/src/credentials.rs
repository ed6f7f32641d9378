//! Bearer token lookup. The engine only ever sees a `CredentialProvider`;
//! where the token actually lives is the provider's business.

use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::CredentialsConfig;

/// An opaque bearer token. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    /// Trimmed token, or `None` if nothing is left.
    pub fn new(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Token(trimmed.to_string()))
        }
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(***)")
    }
}

pub trait CredentialProvider: Send + Sync {
    /// Resolve the current token. Called once per dispatch.
    fn token(&self) -> Option<Token>;

    /// Short label for diagnostics.
    fn name(&self) -> String;
}

/// A token fixed at construction.
pub struct StaticToken(Option<Token>);

impl StaticToken {
    pub fn new(raw: &str) -> Self {
        Self(Token::new(raw))
    }
}

impl CredentialProvider for StaticToken {
    fn token(&self) -> Option<Token> {
        self.0.clone()
    }

    fn name(&self) -> String {
        "static".to_string()
    }
}

pub struct EnvToken {
    var: String,
}

impl EnvToken {
    pub fn new(var: &str) -> Self {
        Self { var: var.to_string() }
    }
}

impl CredentialProvider for EnvToken {
    fn token(&self) -> Option<Token> {
        std::env::var(&self.var).ok().and_then(|v| Token::new(&v))
    }

    fn name(&self) -> String {
        format!("env:{}", self.var)
    }
}

#[derive(Deserialize)]
struct SecretDocument {
    github: Option<TokenDocument>,
}

#[derive(Deserialize)]
struct TokenDocument {
    token: Option<String>,
}

fn read_document<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            log::warn!("Failed to read credentials from {:?}: {}", path, e);
            return None;
        }
    };
    match serde_json::from_str(&content) {
        Ok(doc) => Some(doc),
        Err(e) => {
            log::warn!("Ignoring malformed credentials file {:?}: {}", path, e);
            None
        }
    }
}

/// Decoded secrets document: `{"github": {"token": "..."}}`.
pub struct SecretFile {
    path: PathBuf,
}

impl SecretFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CredentialProvider for SecretFile {
    fn token(&self) -> Option<Token> {
        let doc: SecretDocument = read_document(&self.path)?;
        doc.github
            .and_then(|github| github.token)
            .and_then(|raw| Token::new(&raw))
    }

    fn name(&self) -> String {
        format!("secret-file:{}", self.path.display())
    }
}

/// Stored token document: `{"token": "..."}`.
pub struct TokenFile {
    path: PathBuf,
}

impl TokenFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CredentialProvider for TokenFile {
    fn token(&self) -> Option<Token> {
        let doc: TokenDocument = read_document(&self.path)?;
        doc.token.and_then(|raw| Token::new(&raw))
    }

    fn name(&self) -> String {
        format!("token-file:{}", self.path.display())
    }
}

/// Providers tried in order; the first one holding a token wins.
#[derive(Default)]
pub struct CredentialChain {
    providers: Vec<Box<dyn CredentialProvider>>,
}

impl CredentialChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: impl CredentialProvider + 'static) -> Self {
        self.providers.push(Box::new(provider));
        self
    }

    /// Environment variable, then secret file, then stored token file.
    pub fn from_config(config: &CredentialsConfig) -> Self {
        let mut chain = Self::new().with(EnvToken::new(&config.env_var));
        if let Some(ref path) = config.secret_file {
            chain = chain.with(SecretFile::new(path));
        }
        if let Some(ref path) = config.token_file {
            chain = chain.with(TokenFile::new(path));
        }
        chain
    }
}

impl CredentialProvider for CredentialChain {
    fn token(&self) -> Option<Token> {
        for provider in &self.providers {
            if let Some(token) = provider.token() {
                log::debug!("Using token from {}", provider.name());
                return Some(token);
            }
        }
        None
    }

    fn name(&self) -> String {
        let names: Vec<String> = self.providers.iter().map(|p| p.name()).collect();
        format!("chain[{}]", names.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn token_is_trimmed_and_redacted() {
        let token = Token::new("  ghp_abc \n").unwrap();
        assert_eq!(token.expose(), "ghp_abc");
        assert_eq!(format!("{:?}", token), "Token(***)");
        assert!(Token::new("   ").is_none());
    }

    #[test]
    fn secret_file_wins_over_token_file() {
        let dir = tempfile::tempdir().unwrap();
        let secret = write_file(&dir, "secret.json", r#"{"github":{"token":"from-secret"}}"#);
        let stored = write_file(&dir, "token.json", r#"{"token":"from-store"}"#);

        let chain = CredentialChain::new()
            .with(SecretFile::new(&secret))
            .with(TokenFile::new(&stored));
        assert_eq!(chain.token().unwrap().expose(), "from-secret");
    }

    #[test]
    fn falls_through_empty_missing_and_malformed_sources() {
        let dir = tempfile::tempdir().unwrap();
        let empty_secret = write_file(&dir, "secret.json", r#"{"github":{"token":"  "}}"#);
        let garbage = write_file(&dir, "garbage.json", "not json");
        let stored = write_file(&dir, "token.json", r#"{"token":"from-store"}"#);

        let chain = CredentialChain::new()
            .with(SecretFile::new(&empty_secret))
            .with(SecretFile::new(dir.path().join("missing.json")))
            .with(TokenFile::new(&garbage))
            .with(TokenFile::new(&stored));
        assert_eq!(chain.token().unwrap().expose(), "from-store");
    }

    #[test]
    fn empty_chain_has_no_token() {
        let chain = CredentialChain::new().with(StaticToken::new(""));
        assert!(chain.token().is_none());
        assert_eq!(chain.name(), "chain[static]");
    }
}
