// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! TLS client context construction.
//!
//! A transport is either plain TCP, wrapped with a caller supplied
//! `rustls::ClientConfig`, or wrapped with a context built here from
//! [`TlsOptions`]. Built contexts trust the webpki root set, plus an optional
//! CA bundle.

use std::path::PathBuf;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme, SupportedProtocolVersion};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{AppError, AppResult};

#[derive(Debug, Clone)]
pub enum TlsConfig {
    Disabled,
    /// a fully built context supplied by the caller
    Context(Arc<rustls::ClientConfig>),
    Options(TlsOptions),
}

impl TlsConfig {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, TlsConfig::Disabled)
    }

    /// The context to wrap the socket with, `None` for plain TCP.
    pub fn client_config(&self) -> AppResult<Option<Arc<rustls::ClientConfig>>> {
        match self {
            TlsConfig::Disabled => Ok(None),
            TlsConfig::Context(context) => Ok(Some(context.clone())),
            TlsConfig::Options(options) => options.build().map(Some),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsOptions {
    /// "1.2" or "1.3"; both are allowed when unset
    pub version: Option<String>,
    /// verify the server certificate chain
    pub verify: bool,
    /// verify that the certificate is valid for the host we connect to
    pub check_hostname: bool,
    /// client certificate chain, PEM
    pub certfile: Option<PathBuf>,
    /// client private key, PEM
    pub keyfile: Option<PathBuf>,
    /// extra trust anchors, PEM
    pub cafile: Option<PathBuf>,
}

impl Default for TlsOptions {
    fn default() -> Self {
        TlsOptions {
            version: None,
            verify: true,
            check_hostname: true,
            certfile: None,
            keyfile: None,
            cafile: None,
        }
    }
}

impl TlsOptions {
    pub fn build(&self) -> AppResult<Arc<rustls::ClientConfig>> {
        let provider = Arc::new(ring::default_provider());
        let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(self.protocol_versions()?)?;

        let builder = if !self.verify {
            warn!("TLS certificate verification is disabled");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerification(provider)))
        } else {
            let roots = self.root_store()?;
            if self.check_hostname {
                builder.with_root_certificates(roots)
            } else {
                let inner =
                    WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider)
                        .build()
                        .map_err(|e| AppError::TlsError(e.to_string()))?;
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(AnyHostname(inner)))
            }
        };

        let config = match (&self.certfile, &self.keyfile) {
            (Some(certfile), Some(keyfile)) => {
                let chain = CertificateDer::pem_file_iter(certfile)
                    .map_err(pem_error)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(pem_error)?;
                let key = PrivateKeyDer::from_pem_file(keyfile).map_err(pem_error)?;
                builder.with_client_auth_cert(chain, key)?
            }
            (None, None) => builder.with_no_client_auth(),
            _ => {
                return Err(AppError::InvalidValue(
                    "certfile and keyfile must be given together".to_string(),
                ))
            }
        };
        Ok(Arc::new(config))
    }

    fn protocol_versions(&self) -> AppResult<&'static [&'static SupportedProtocolVersion]> {
        static TLS12_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS12];
        static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];
        match self.version.as_deref() {
            None => Ok(rustls::DEFAULT_VERSIONS),
            Some("1.2") => Ok(TLS12_ONLY),
            Some("1.3") => Ok(TLS13_ONLY),
            Some(other) => Err(AppError::InvalidValue(format!(
                "unsupported TLS version {}",
                other
            ))),
        }
    }

    fn root_store(&self) -> AppResult<RootCertStore> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        if let Some(cafile) = &self.cafile {
            for cert in CertificateDer::pem_file_iter(cafile).map_err(pem_error)? {
                roots.add(cert.map_err(pem_error)?)?;
            }
        }
        Ok(roots)
    }
}

pub(crate) fn server_name(host: &str) -> AppResult<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|e| AppError::TlsError(format!("invalid server name {}: {}", host, e)))
}

fn pem_error(error: rustls::pki_types::pem::Error) -> AppError {
    AppError::TlsError(format!("pem: {:?}", error))
}

/// Accepts every certificate. Handshake signatures are still checked so the
/// peer must hold the key of the certificate it presents.
#[derive(Debug)]
struct NoVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Full chain verification that tolerates a certificate issued for another
/// host name.
#[derive(Debug)]
struct AnyHostname(Arc<WebPkiServerVerifier>);

impl ServerCertVerifier for AnyHostname {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self.0.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            // newer rustls releases attach context to this variant
            Err(rustls::Error::InvalidCertificate(error))
                if format!("{:?}", error).starts_with("NotValidForName") =>
            {
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.0.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.0.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.supported_verify_schemes()
    }
}
