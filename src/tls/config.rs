//! rustls configuration built from issued identities.

use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, RootCertStore, ServerConfig};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, warn};

use crate::error::StartupError;
use crate::tls::TlsIdentity;

/// Builds the server-side TLS configuration for the intercepting listener.
pub fn server_config(identity: &TlsIdentity) -> Result<Arc<ServerConfig>, StartupError> {
    let chain = identity.cert_chain()?;
    let key = identity.private_key()?;

    let mut config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(chain, key)?;

    // One request per connection, HTTP/1.1 only.
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

/// Builds the client configuration used for TLS connections to origins.
pub fn upstream_client_config(skip_verify: bool) -> Arc<ClientConfig> {
    if skip_verify {
        warn!("⚠️  Upstream certificate verification disabled");
        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(AcceptAllVerifier))
            .with_no_client_auth();
        return Arc::new(config);
    }

    let mut roots = RootCertStore::empty();
    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            let mut added = 0usize;
            for cert_der in certs {
                if roots.add(&Certificate(cert_der.to_vec())).is_ok() {
                    added += 1;
                }
            }
            debug!("loaded {} system root certificates", added);
        }
        // An empty root store still allows plaintext forwarding to work.
        Err(err) => warn!("could not load system root certificates: {}", err),
    }

    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Arc::new(config)
}

/// Accepts any upstream certificate. Only reachable when
/// `skip_upstream_verify` is set in the TLS settings.
struct AcceptAllVerifier;

impl ServerCertVerifier for AcceptAllVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}
