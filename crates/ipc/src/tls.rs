//! TLS material for the protocol endpoints.
//!
//! Each endpoint is handed its own key material explicitly; nothing is
//! process-global, so two servers in one process can present different
//! identities. The protocol is pinned to TLS 1.2 with the AES-128-GCM
//! ECDHE-RSA suite, and the server requires client certificates.
//!
//! Key material is PEM: the keystore file carries the endpoint certificate
//! chain and private key, the truststore file the peer root certificates.

use std::{
    path::Path,
    sync::Arc,
};

use anyhow::Context;
use common::errors::ErrorMetadata;
use rustls::{
    crypto::{
        aws_lc_rs,
        CryptoProvider,
    },
    server::WebPkiClientVerifier,
    ClientConfig,
    RootCertStore,
    ServerConfig,
};
use rustls_pki_types::{
    pem::PemObject,
    CertificateDer,
    PrivateKeyDer,
};

fn restricted_provider() -> Arc<CryptoProvider> {
    let mut provider = aws_lc_rs::default_provider();
    provider.cipher_suites =
        vec![aws_lc_rs::cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256];
    Arc::new(provider)
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let certs: Vec<_> = CertificateDer::pem_file_iter(path)
        .map_err(auth_material(path))?
        .collect::<Result<_, _>>()
        .map_err(auth_material(path))?;
    anyhow::ensure!(
        !certs.is_empty(),
        ErrorMetadata::auth_material_invalid(
            "EmptyCertificateFile",
            format!("No certificates in {}", path.display()),
        )
    );
    Ok(certs)
}

fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    PrivateKeyDer::from_pem_file(path).map_err(auth_material(path))
}

fn load_roots(path: &Path) -> anyhow::Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert).map_err(|e| {
            anyhow::anyhow!(e).context(ErrorMetadata::auth_material_invalid(
                "BadRootCertificate",
                format!("Rejected root certificate in {}", path.display()),
            ))
        })?;
    }
    Ok(roots)
}

fn auth_material<E: std::fmt::Debug>(path: &Path) -> impl FnOnce(E) -> anyhow::Error + '_ {
    move |e| {
        anyhow::anyhow!("{e:?}").context(ErrorMetadata::auth_material_invalid(
            "UnreadableTlsMaterial",
            format!("Cannot load TLS material from {}", path.display()),
        ))
    }
}

/// Server side: mutual auth against the truststore roots, identity from the
/// keystore.
pub fn server_config(keystore: &Path, truststore: &Path) -> anyhow::Result<Arc<ServerConfig>> {
    let provider = restricted_provider();
    let roots = Arc::new(load_roots(truststore)?);
    let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider.clone())
        .build()
        .map_err(|e| {
            anyhow::anyhow!(e).context(ErrorMetadata::auth_material_invalid(
                "BadTruststore",
                "Cannot build client certificate verifier",
            ))
        })?;
    let config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS12])
        .context("TLS 1.2 not supported by the provider")?
        .with_client_cert_verifier(verifier)
        .with_single_cert(load_certs(keystore)?, load_key(keystore)?)
        .map_err(|e| {
            anyhow::anyhow!(e).context(ErrorMetadata::auth_material_invalid(
                "BadKeystore",
                "Certificate chain and key do not match",
            ))
        })?;
    Ok(Arc::new(config))
}

/// Client side: verifies the server against the truststore and presents the
/// keystore identity.
pub fn client_config(keystore: &Path, truststore: &Path) -> anyhow::Result<Arc<ClientConfig>> {
    let provider = restricted_provider();
    let roots = load_roots(truststore)?;
    let config = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS12])
        .context("TLS 1.2 not supported by the provider")?
        .with_root_certificates(roots)
        .with_client_auth_cert(load_certs(keystore)?, load_key(keystore)?)
        .map_err(|e| {
            anyhow::anyhow!(e).context(ErrorMetadata::auth_material_invalid(
                "BadKeystore",
                "Certificate chain and key do not match",
            ))
        })?;
    Ok(Arc::new(config))
}
