//! CRL distribution (spec §3 "Issued certificate", §6 `/v1/public/crl`).

use crate::error::CaError;
use std::path::Path;

/// Reads `<cert_root>/<stack>/crl.pem`, the file `renew_crl` keeps
/// up to date after every revocation.
pub async fn read_crl(cert_root: &Path, stack: &str) -> Result<Vec<u8>, CaError> {
    let path = cert_root.join(stack).join("crl.pem");
    tokio::fs::read(&path).await.map_err(|_| CaError::NotFound)
}
