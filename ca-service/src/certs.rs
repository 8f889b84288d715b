//! Certificate creation and revocation via the CA's OpenSSL-adjacent
//! shell scripts (spec §4.4).

use crate::error::CaError;
use crate::token::sanitize_input;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

const SUBPROCESS_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
pub enum CertKind {
    Admin,
    Computer,
}

impl CertKind {
    fn create_script(&self) -> &'static str {
        match self {
            CertKind::Admin => "/usr/bin/create_cert_admin.sh",
            CertKind::Computer => "/usr/bin/create_cert_computer.sh",
        }
    }

    fn resource_dir_name(&self) -> &'static str {
        match self {
            CertKind::Admin => "admin",
            CertKind::Computer => "computer",
        }
    }
}

/// Invokes `create_cert_{admin,computer}.sh fqdn host stack common_name
/// password days email` with every free-text arg sanitized, bounded by a
/// 30s subprocess timeout. Returns the path to the resulting `.tar` on
/// success.
pub async fn create_cert(
    kind: CertKind,
    cert_root: &Path,
    fqdn: &str,
    host: &str,
    stack: &str,
    common_name: &str,
    password: &str,
    validity_days: i64,
    email: &str,
) -> Result<PathBuf, CaError> {
    let stack_clean = sanitize_input(stack);
    let common_name_clean = sanitize_input(common_name);
    let email_clean = sanitize_input(email);
    let days_clean = validity_days.to_string();

    let mut cmd = Command::new(kind.create_script());
    cmd.arg(fqdn)
        .arg(host)
        .arg(&stack_clean)
        .arg(&common_name_clean)
        .arg(password)
        .arg(&days_clean)
        .arg(&email_clean)
        .kill_on_drop(true);

    let output = tokio::time::timeout(SUBPROCESS_TIMEOUT, cmd.output())
        .await
        .map_err(|_| CaError::CreationFailed)?
        .map_err(|_| CaError::CreationFailed)?;

    if !output.status.success() {
        tracing::error!(
            stack = %stack_clean,
            stderr = %String::from_utf8_lossy(&output.stderr),
            "certificate creation script failed"
        );
        return Err(CaError::CreationFailed);
    }

    tracing::info!(email = %email_clean, stack = %stack_clean, "certificate created");

    Ok(cert_root
        .join(&stack_clean)
        .join(kind.resource_dir_name())
        .join(format!("{common_name_clean}.tar")))
}

/// Revokes `<cert_root>/<stack>/<kind>/certs/<common_name>.crt` via
/// `openssl ca -revoke`, renews the CRL, and deletes the cert file.
/// Idempotent: a missing cert returns [`CaError::NotFound`], never a
/// partial revocation.
pub async fn revoke_cert(
    kind: CertKind,
    cert_root: &Path,
    stack: &str,
    common_name: &str,
) -> Result<(), CaError> {
    let resource_dir = cert_root.join(stack).join(kind.resource_dir_name());
    let cert_path = resource_dir.join("certs").join(format!("{common_name}.crt"));

    if !tokio::fs::try_exists(&cert_path).await.unwrap_or(false) {
        return Err(CaError::NotFound);
    }

    let openssl_cnf = resource_dir.join("openssl.cnf");
    let revoke = Command::new("openssl")
        .arg("ca")
        .arg("-config")
        .arg(&openssl_cnf)
        .arg("-revoke")
        .arg(&cert_path)
        .kill_on_drop(true)
        .status()
        .await
        .map_err(|_| CaError::RevocationFailed)?;

    if !revoke.success() {
        tracing::error!(stack, common_name, "openssl -revoke failed");
        return Err(CaError::RevocationFailed);
    }

    let renew = Command::new("/usr/bin/renew_crl")
        .kill_on_drop(true)
        .status()
        .await
        .map_err(|_| CaError::RevocationFailed)?;
    if !renew.success() {
        tracing::error!(stack, common_name, "renew_crl failed");
        return Err(CaError::RevocationFailed);
    }

    tokio::fs::remove_file(&cert_path).await.map_err(CaError::Io)?;

    tracing::info!(common_name, stack, path = %cert_path.display(), "certificate revoked");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_script_paths_match_the_two_resource_kinds() {
        assert_eq!(CertKind::Admin.create_script(), "/usr/bin/create_cert_admin.sh");
        assert_eq!(CertKind::Computer.create_script(), "/usr/bin/create_cert_computer.sh");
    }

    #[tokio::test]
    async fn revoke_missing_cert_returns_not_found() {
        let dir = std::env::temp_dir().join(format!("ca-service-revoke-test-{}", std::process::id()));
        let _ = tokio::fs::remove_dir_all(&dir).await;
        tokio::fs::create_dir_all(&dir).await.unwrap();

        let result = revoke_cert(CertKind::Admin, &dir, "stack1", "ghost").await;
        assert!(matches!(result, Err(CaError::NotFound)));

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
