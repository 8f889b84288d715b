//! Single-use token issuance and validation (spec §3 "CA token", §4.4,
//! §8 token invariants).

use crate::error::CaError;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Throttles every failure path to slow down token enumeration, matching
/// the flat `time.sleep(3)` on each rejection branch of the original
/// validator.
const FAILURE_THROTTLE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Admin,
    Computer,
}

impl Resource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Admin => "admin",
            Resource::Computer => "computer",
        }
    }
}

/// Rejects anything but `[A-Za-z0-9_-]+`, and explicitly rejects `..`,
/// `/`, `\` even though the character class already excludes them, to
/// mirror the two independent checks in the original validator.
pub fn validate_stack_name(stack: &str) -> Result<(), CaError> {
    let ok = !stack.is_empty()
        && stack.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !ok || stack.contains("..") || stack.contains('/') || stack.contains('\\') {
        return Err(CaError::InvalidStack(stack.to_string()));
    }
    Ok(())
}

/// Strips everything outside `[A-Za-z0-9@._:-]`, used to sanitize
/// subprocess arguments before they reach a shell script (spec §4.4).
pub fn sanitize_input(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '@' | '.' | '_' | ':' | '-' | '+'))
        .collect()
}

pub struct TokenValidator {
    pub token_file: PathBuf,
    pub stack: String,
    token: String,
}

impl TokenValidator {
    pub fn new(cert_root: &Path, stack: &str, resource: Resource, token: &str) -> Self {
        let token_file = cert_root.join(stack).join(resource.as_str()).join("tokens").join(token);
        Self { token_file, stack: stack.to_string(), token: token.to_string() }
    }

    /// Validates length, existence, age, and content shape, returning
    /// `(common_name, validity_days)` on success. Does not consume the
    /// token — call [`TokenValidator::consume`] after the certificate
    /// has actually been delivered.
    pub async fn validate(&self, max_token_age_hours: i64) -> Result<(String, i64), CaError> {
        if self.token.len() != 64 {
            tokio::time::sleep(FAILURE_THROTTLE).await;
            return Err(CaError::InvalidToken);
        }

        let metadata = match tokio::fs::metadata(&self.token_file).await {
            Ok(m) => m,
            Err(_) => {
                tokio::time::sleep(FAILURE_THROTTLE).await;
                return Err(CaError::InvalidToken);
            }
        };

        let created: DateTime<Utc> = metadata
            .created()
            .or_else(|_| metadata.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        let age = Utc::now().signed_duration_since(created);

        if age.num_hours() > max_token_age_hours {
            let _ = tokio::fs::remove_file(&self.token_file).await;
            tokio::time::sleep(FAILURE_THROTTLE).await;
            return Err(CaError::TokenExpired);
        }

        let content = match tokio::fs::read_to_string(&self.token_file).await {
            Ok(c) => c.trim().to_string(),
            Err(_) => {
                tokio::time::sleep(FAILURE_THROTTLE).await;
                return Err(CaError::InvalidToken);
            }
        };

        let mut parts = content.splitn(2, '|');
        let (common_name, validity_days) = match (parts.next(), parts.next()) {
            (Some(cn), Some(days)) if !cn.is_empty() => (cn.to_string(), days.to_string()),
            _ => {
                tokio::time::sleep(FAILURE_THROTTLE).await;
                return Err(CaError::InvalidToken);
            }
        };

        let validity_days: i64 = match validity_days.parse() {
            Ok(n) => n,
            Err(_) => {
                tokio::time::sleep(FAILURE_THROTTLE).await;
                return Err(CaError::InvalidToken);
            }
        };

        Ok((common_name, validity_days))
    }

    /// Deletes the token file. Safe to call even if it's already gone.
    pub async fn consume(&self) -> Result<(), CaError> {
        match tokio::fs::remove_file(&self.token_file).await {
            Ok(()) | Err(_) => Ok(()),
        }
    }
}

/// Generates a 32-byte (64 hex char) token and writes
/// `<cert_root>/<stack>/<resource>/tokens/<token>` with content
/// `common_name|validity_days` (spec §4.4 "Token creation").
pub async fn issue_token(
    cert_root: &Path,
    stack: &str,
    resource: Resource,
    common_name: &str,
    validity_days: u32,
) -> Result<String, CaError> {
    validate_stack_name(stack)?;

    let mut bytes = [0u8; 32];
    use rand::RngCore;
    rand::thread_rng().fill_bytes(&mut bytes);
    let token = hex::encode(bytes);

    let dir = cert_root.join(stack).join(resource.as_str()).join("tokens");
    tokio::fs::create_dir_all(&dir).await?;

    let content = format!("{common_name}|{validity_days}");
    tokio::fs::write(dir.join(&token), content).await?;

    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_stack_name_accepts_alnum_dash_underscore() {
        assert!(validate_stack_name("swarm-prod_01").is_ok());
    }

    #[test]
    fn validate_stack_name_rejects_traversal() {
        assert!(validate_stack_name("../etc").is_err());
        assert!(validate_stack_name("a/b").is_err());
        assert!(validate_stack_name("a\\b").is_err());
    }

    #[test]
    fn sanitize_input_strips_shell_metacharacters() {
        assert_eq!(sanitize_input("alice; rm -rf /"), "alice rm -rf");
    }

    #[tokio::test]
    async fn validate_rejects_short_token_without_touching_disk() {
        let validator = TokenValidator::new(
            Path::new("/tmp/does-not-exist"),
            "stack",
            Resource::Admin,
            "short",
        );
        let result = validator.validate(72).await;
        assert!(matches!(result, Err(CaError::InvalidToken)));
    }

    #[tokio::test]
    async fn issue_then_validate_then_consume_round_trips() {
        let dir = std::env::temp_dir().join(format!("ca-service-test-{}", std::process::id()));
        let _ = tokio::fs::remove_dir_all(&dir).await;
        tokio::fs::create_dir_all(&dir).await.unwrap();

        let token = issue_token(&dir, "stack1", Resource::Admin, "alice", 30).await.unwrap();
        assert_eq!(token.len(), 64);

        let validator = TokenValidator::new(&dir, "stack1", Resource::Admin, &token);
        let (cn, days) = validator.validate(72).await.unwrap();
        assert_eq!(cn, "alice");
        assert_eq!(days, 30);

        validator.consume().await.unwrap();
        let result = validator.validate(72).await;
        assert!(matches!(result, Err(CaError::InvalidToken)));

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
