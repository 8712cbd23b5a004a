//! TLS configuration and certificate loading.
//!
//! Listener certificates are loaded through `axum-server`'s rustls helper.
//! PEM material embedded in the infrastructure document (database CA bundles,
//! client certificates) is only checked for well-formedness here; the
//! services consume it themselves.

use std::io::BufReader;
use std::path::Path;

use axum_server::tls_rustls::RustlsConfig;

/// Load TLS configuration from certificate and key files.
pub async fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<RustlsConfig, std::io::Error> {
    if !cert_path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Certificate file not found: {:?}", cert_path),
        ));
    }
    if !key_path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Private key file not found: {:?}", key_path),
        ));
    }

    RustlsConfig::from_pem_file(cert_path, key_path).await
}

/// Check that `pem` holds at least one well-formed certificate.
/// Returns the number of certificates found.
pub fn validate_certificates(pem: &str) -> Result<usize, String> {
    let mut reader = BufReader::new(pem.as_bytes());
    let mut count = 0;
    for cert in rustls_pemfile::certs(&mut reader) {
        cert.map_err(|e| format!("malformed certificate: {}", e))?;
        count += 1;
    }
    if count == 0 {
        return Err("no PEM certificate found".to_string());
    }
    Ok(count)
}

/// Check that `pem` holds a well-formed private key (PKCS#1, PKCS#8 or SEC1).
pub fn validate_private_key(pem: &str) -> Result<(), String> {
    let mut reader = BufReader::new(pem.as_bytes());
    match rustls_pemfile::private_key(&mut reader) {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err("no PEM private key found".to_string()),
        Err(e) => Err(format!("malformed private key: {}", e)),
    }
}

/// Check the files a TLS listener will load, before anything is started.
pub fn validate_listener_files(cert_path: &Path, key_path: &Path) -> Result<(), String> {
    let cert = std::fs::read_to_string(cert_path)
        .map_err(|e| format!("cannot read {}: {}", cert_path.display(), e))?;
    validate_certificates(&cert)?;
    let key = std::fs::read_to_string(key_path)
        .map_err(|e| format!("cannot read {}: {}", key_path.display(), e))?;
    validate_private_key(&key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_garbage() {
        assert!(validate_certificates("not a certificate").is_err());
        assert!(validate_private_key("not a key").is_err());
    }

    #[test]
    fn missing_files_are_reported() {
        let err = validate_listener_files(Path::new("/nonexistent/cert.pem"), Path::new("/nonexistent/key.pem"))
            .unwrap_err();
        assert!(err.contains("/nonexistent/cert.pem"));
    }
}
