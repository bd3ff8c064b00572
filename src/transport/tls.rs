//! TLS client configuration for TCP connections.

use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::config::{ConfigError, TlsOptions};

/// Build a TLS client configuration from the descriptor's TLS options.
///
/// Roots come from `ca_file` when present, otherwise from the platform's native
/// certificate store. A client certificate is presented when both `cert_file`
/// and `key_file` are set.
pub fn client_config(options: &TlsOptions) -> Result<ClientConfig, ConfigError> {
    if options.cert_file.is_some() != options.key_file.is_some() {
        return Err(ConfigError::Tls(
            "client certificate and key must be provided together".into(),
        ));
    }

    let roots = Arc::new(root_store(options.ca_file.as_deref())?);

    let builder = ClientConfig::builder_with_provider(provider()?)
        .with_safe_default_protocol_versions()
        .map_err(|error| ConfigError::Tls(error.to_string()))?;
    let builder = if options.verify_hostname {
        builder.with_root_certificates(roots)
    } else {
        let provider = builder.crypto_provider().clone();
        let inner = WebPkiServerVerifier::builder_with_provider(roots, provider)
            .build()
            .map_err(|error| ConfigError::Tls(error.to_string()))?;
        tracing::warn!("tls hostname verification is disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(IgnoreHostname { inner }))
    };

    match (&options.cert_file, &options.key_file) {
        (Some(cert), Some(key)) => {
            let chain = CertificateDer::pem_file_iter(cert)
                .and_then(|certs| certs.collect::<Result<Vec<_>, _>>())
                .map_err(|error| pem_error(cert, error))?;
            let key = PrivateKeyDer::from_pem_file(key).map_err(|error| pem_error(key, error))?;
            builder
                .with_client_auth_cert(chain, key)
                .map_err(|error| ConfigError::Tls(error.to_string()))
        }
        _ => Ok(builder.with_no_client_auth()),
    }
}

/// The installed process default provider, or the one selected by crate features.
fn provider() -> Result<Arc<CryptoProvider>, ConfigError> {
    if let Some(provider) = CryptoProvider::get_default() {
        return Ok(provider.clone());
    }

    #[cfg(feature = "tls-aws-lc")]
    return Ok(Arc::new(rustls::crypto::aws_lc_rs::default_provider()));

    #[cfg(all(feature = "tls-ring", not(feature = "tls-aws-lc")))]
    return Ok(Arc::new(rustls::crypto::ring::default_provider()));

    #[cfg(not(any(feature = "tls-ring", feature = "tls-aws-lc")))]
    Err(ConfigError::Tls(
        "no crypto provider: enable `tls-ring` or `tls-aws-lc`, or install a process default"
            .into(),
    ))
}

fn root_store(ca_file: Option<&Path>) -> Result<RootCertStore, ConfigError> {
    let mut roots = RootCertStore::empty();

    if let Some(path) = ca_file {
        for cert in CertificateDer::pem_file_iter(path).map_err(|error| pem_error(path, error))? {
            let cert = cert.map_err(|error| pem_error(path, error))?;
            roots
                .add(cert)
                .map_err(|error| ConfigError::Tls(format!("{}: {error}", path.display())))?;
        }
        return Ok(roots);
    }

    let native = rustls_native_certs::load_native_certs();
    for error in &native.errors {
        tracing::debug!(%error, "skipping platform certificate");
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    tracing::trace!(added, ignored, "loaded platform certificates");
    Ok(roots)
}

fn pem_error(path: &Path, error: rustls::pki_types::pem::Error) -> ConfigError {
    ConfigError::Tls(format!("{}: {error}", path.display()))
}

/// Verifies the chain and signatures, but accepts certificates issued for a
/// different host name.
#[derive(Debug)]
struct IgnoreHostname {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for IgnoreHostname {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. },
            )) => Ok(ServerCertVerified::assertion()),
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cert_without_key_is_rejected() {
        let options = TlsOptions {
            cert_file: Some("cert.pem".into()),
            ..TlsOptions::default()
        };
        let err = client_config(&options).unwrap_err();
        assert!(matches!(err, ConfigError::Tls(_)));
    }

    #[test]
    fn missing_ca_file() {
        let dir = tempfile::tempdir().unwrap();
        let options = TlsOptions {
            ca_file: Some(dir.path().join("missing.pem")),
            ..TlsOptions::default()
        };
        let err = client_config(&options).unwrap_err();
        assert!(err.to_string().contains("missing.pem"));
    }
}
