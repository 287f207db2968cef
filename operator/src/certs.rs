//! Cluster CA and the CA-signed certificates used for admin API mTLS and the
//! admission webhook.

use std::collections::BTreeMap;

use chrono::{Datelike, Utc};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::ResourceExt;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose,
};
use tracing::info;

use crate::consts::{CA_CERT_KEY, CERTIFICATE_SANS_ANNOTATION, TLS_CERT_KEY, TLS_KEY_KEY};
use crate::labels::Selector;
use crate::owned::ensure_owned;
use crate::store::ObjectStore;
use crate::utils::compute_hash;
use crate::{Config, Error, Result};

const SECRET_TYPE_TLS: &str = "kubernetes.io/tls";

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub enum Usage {
    Server,
    Client,
}

/// The CA signing every certificate the operator issues.
#[derive(Clone, Debug)]
pub struct ClusterCa {
    cert_pem: String,
    key_pem: String,
}

impl ClusterCa {
    pub fn generate() -> Result<Self> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String("Kong Gateway Operator CA".to_string()),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String("Kong".to_string()),
        );
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let year = Utc::now().year();
        params.not_before = rcgen::date_time_ymd(year - 1, 1, 1);
        params.not_after = rcgen::date_time_ymd(year + 10, 1, 1);

        let key = KeyPair::generate()?;
        let cert = params.self_signed(&key)?;
        Ok(ClusterCa {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }

    pub fn from_secret(secret: &Secret) -> Option<Self> {
        let data = secret.data.as_ref()?;
        let cert = String::from_utf8(data.get(TLS_CERT_KEY)?.0.clone()).ok()?;
        let key = String::from_utf8(data.get(TLS_KEY_KEY)?.0.clone()).ok()?;
        Some(ClusterCa {
            cert_pem: cert,
            key_pem: key,
        })
    }

    pub fn to_secret(&self, namespace: &str, name: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            type_: Some(SECRET_TYPE_TLS.to_string()),
            data: Some(BTreeMap::from([
                (TLS_CERT_KEY.to_string(), ByteString(self.cert_pem.clone().into_bytes())),
                (TLS_KEY_KEY.to_string(), ByteString(self.key_pem.clone().into_bytes())),
            ])),
            ..Default::default()
        }
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Issues a certificate for `common_name` valid for the given DNS names.
    /// Returns the certificate and key as PEM.
    pub fn issue(&self, common_name: &str, dns_names: &[String], usage: Usage) -> Result<(String, String)> {
        let mut params = CertificateParams::new(dns_names.to_vec())?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
        params.distinguished_name = dn;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![match usage {
            Usage::Server => ExtendedKeyUsagePurpose::ServerAuth,
            Usage::Client => ExtendedKeyUsagePurpose::ClientAuth,
        }];
        let year = Utc::now().year();
        params.not_before = rcgen::date_time_ymd(year - 1, 1, 1);
        params.not_after = rcgen::date_time_ymd(year + 3, 1, 1);

        let ca_key = KeyPair::from_pem(&self.key_pem)?;
        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &ca_key)?;
        let key = KeyPair::generate()?;
        let cert = params.signed_by(&key, &issuer)?;
        Ok((cert.pem(), key.serialize_pem()))
    }
}

/// Loads the cluster CA from its Secret, generating and storing it on first use.
pub async fn ensure_cluster_ca<S: ObjectStore>(store: &S, config: &Config) -> Result<ClusterCa> {
    let namespace = config.namespace.as_str();
    let name = config.cluster_ca_secret.as_str();
    if let Some(secret) = store.get::<Secret>(Some(namespace), name).await? {
        return ClusterCa::from_secret(&secret).ok_or_else(|| {
            Error::CertificateError(format!("cluster CA Secret {namespace}/{name} is malformed"))
        });
    }

    let ca = ClusterCa::generate()?;
    match store.create(&ca.to_secret(namespace, name)).await {
        Ok(_) => {
            info!(namespace, name, "generated cluster CA");
            Ok(ca)
        }
        // Another reconciler stored a CA first; use that one.
        Err(err) if err.is_conflict() => {
            let secret = store
                .get::<Secret>(Some(namespace), name)
                .await?
                .ok_or_else(|| Error::CertificateError("cluster CA Secret vanished".to_string()))?;
            ClusterCa::from_secret(&secret).ok_or_else(|| {
                Error::CertificateError(format!("cluster CA Secret {namespace}/{name} is malformed"))
            })
        }
        Err(err) => Err(err),
    }
}

/// A certificate Secret to keep in place for one owner.
pub struct CertificateRequest<'a> {
    pub metadata: ObjectMeta,
    pub selector: &'a Selector,
    pub common_name: String,
    pub dns_names: Vec<String>,
    pub usage: Usage,
}

/// Makes the owned TLS Secret described by `request` exist. The certificate is
/// only re-issued when the CA or the requested names changed.
pub async fn ensure_certificate_secret<S: ObjectStore>(
    store: &S,
    ca: &ClusterCa,
    request: CertificateRequest<'_>,
) -> Result<Secret> {
    let namespace = request.metadata.namespace.clone();
    let fingerprint = compute_hash(&(
        compute_hash(&ca.cert_pem()),
        &request.common_name,
        &request.dns_names,
        request.usage,
    ));

    let existing: Vec<Secret> = store.list(namespace.as_deref(), request.selector).await?;
    let reusable = existing.iter().find(|secret| {
        secret.annotations().get(CERTIFICATE_SANS_ANNOTATION) == Some(&fingerprint)
            && secret.data.as_ref().is_some_and(|d| d.contains_key(TLS_CERT_KEY))
    });

    let data = match reusable {
        Some(secret) => secret.data.clone().unwrap_or_default(),
        None => {
            let (cert, key) = ca.issue(&request.common_name, &request.dns_names, request.usage)?;
            BTreeMap::from([
                (TLS_CERT_KEY.to_string(), ByteString(cert.into_bytes())),
                (TLS_KEY_KEY.to_string(), ByteString(key.into_bytes())),
                (CA_CERT_KEY.to_string(), ByteString(ca.cert_pem().as_bytes().to_vec())),
            ])
        }
    };

    let mut metadata = request.metadata;
    metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(CERTIFICATE_SANS_ANNOTATION.to_string(), fingerprint);
    let desired = Secret {
        metadata,
        type_: Some(SECRET_TYPE_TLS.to_string()),
        data: Some(data),
        ..Default::default()
    };
    ensure_owned(store, namespace.as_deref(), request.selector, desired).await
}

/// DNS names a Service is reachable at from inside the cluster.
pub fn service_dns_names(name: &str, namespace: &str) -> Vec<String> {
    vec![
        name.to_string(),
        format!("{name}.{namespace}"),
        format!("{name}.{namespace}.svc"),
        format!("{name}.{namespace}.svc.cluster.local"),
    ]
}
