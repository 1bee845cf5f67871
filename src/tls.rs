//! Process-level TLS setup shared by the WebSocket dialer.

use std::sync::{Arc, OnceLock};

/// Shared client TLS configuration with the webpki root store.
///
/// Building the first config also pins the process-wide rustls
/// CryptoProvider to ring: with both providers compiled in (`ring` and
/// `aws-lc-rs`, which the dependency tree can drag in), rustls refuses to
/// infer a default and the first config build would panic.
pub fn client_config() -> Arc<rustls::ClientConfig> {
    static CONFIG: OnceLock<Arc<rustls::ClientConfig>> = OnceLock::new();
    CONFIG
        .get_or_init(|| {
            // Errs when something else in the process installed a provider
            // first; that's fine.
            let _ = rustls::crypto::ring::default_provider().install_default();

            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

            Arc::new(
                rustls::ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth(),
            )
        })
        .clone()
}
