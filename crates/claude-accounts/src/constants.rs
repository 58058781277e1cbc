//! Credential document and OAuth defaults
//!
//! The client id identifies the public Claude CLI application — it is not a
//! secret. Actual secrets (access/refresh tokens) live in the credentials
//! document and never leave it unredacted.

/// Default location of the credentials document.
pub const DEFAULT_ACCOUNTS_PATH: &str = "~/.claude/accounts.json";

/// Anthropic's public OAuth client ID (same as the Claude CLI).
pub const DEFAULT_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";

/// Default token endpoint for the refresh grant.
pub const DEFAULT_TOKEN_ENDPOINT: &str = "https://console.anthropic.com/v1/oauth/token";

/// Expected access token prefix. Checked as a heuristic only — tokens with
/// other shapes are accepted with a warning.
pub const ACCESS_TOKEN_PREFIX: &str = "sk-ant-oat01-";

/// Expected refresh token prefix (heuristic, see above).
pub const REFRESH_TOKEN_PREFIX: &str = "sk-ant-ort01-";

/// The only document version this build understands.
pub const DOCUMENT_VERSION: u32 = 1;

/// Maximum length of an account name.
pub const MAX_ACCOUNT_NAME_LEN: usize = 32;
