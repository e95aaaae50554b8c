//! Certificate Minter (C1): embedded root CA, per-host leaf minting.

use anyhow::{Context, Result};
use rcgen::{CertificateParams, DistinguishedName, DnType, DnValue, IsCa, KeyPair, KeyUsagePurpose, ExtendedKeyUsagePurpose};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;

/// Embedded root certificate, self-signed, organization "FREE".
///
/// Carried over from the original implementation's hardcoded pair so that
/// trust installed once in a browser keeps working across rebuilds.
const ROOT_CERT_PEM: &str = include_str!("../crts_embedded/root.crt.pem");
const ROOT_KEY_PEM: &str = include_str!("../crts_embedded/root.pem.pem");

/// Directory (relative to the process cwd) holding the root pair and all
/// minted leaf pairs.
const CRTS_DIR: &str = "crts";

/// Guards per-host leaf minting so two tunnels for a brand-new host don't
/// race each other into writing the same files twice (spec.md §5, §9
/// "Per-host certificate race").
#[derive(Clone, Default)]
pub struct CertMinter {
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl CertMinter {
    pub fn new() -> Self {
        Self::default()
    }

    fn host_lock(&self, host: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().expect("cert minter lock poisoned");
        locks
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// `ensure_pair(host) -> (cert_path, key_path)`, idempotent per spec §4.1.
    pub async fn ensure_pair(&self, host: &str) -> Result<(PathBuf, PathBuf)> {
        ensure_root_pair()?;

        let cert_path = PathBuf::from(CRTS_DIR).join(format!("{host}.crt"));
        let key_path = PathBuf::from(CRTS_DIR).join(format!("{host}.key"));
        if cert_path.is_file() && key_path.is_file() {
            return Ok((cert_path, key_path));
        }

        let lock = self.host_lock(host);
        let _guard = lock.lock().await;

        // Re-check now that we hold the per-host lock: another task may
        // have minted the pair while we were waiting.
        if cert_path.is_file() && key_path.is_file() {
            return Ok((cert_path, key_path));
        }

        let (cert_pem, key_pem) = mint_leaf(host)?;
        write_pair(&cert_path, &key_path, &cert_pem, &key_pem)?;
        Ok((cert_path, key_path))
    }
}

/// Write the embedded root pair to `crts/root.crt` / `crts/root.pem` if
/// either is missing (spec.md §4.1 "Bootstrap").
fn ensure_root_pair() -> Result<()> {
    fs::create_dir_all(CRTS_DIR).context("create crts/ directory")?;
    let root_crt = PathBuf::from(CRTS_DIR).join("root.crt");
    let root_key = PathBuf::from(CRTS_DIR).join("root.pem");
    if !root_crt.is_file() {
        fs::write(&root_crt, ROOT_CERT_PEM).context("write crts/root.crt")?;
    }
    if !root_key.is_file() {
        fs::write(&root_key, ROOT_KEY_PEM).context("write crts/root.pem")?;
    }
    Ok(())
}

/// Mint a leaf certificate for `host`, signed by the embedded root.
///
/// The original mints a 2048-bit RSA leaf; `rcgen` has no RSA key
/// generator (only a `RemoteKeyPair` hook for keys minted elsewhere), so
/// the leaf here is ECDSA P-256 instead. `signed_by` lets the leaf use a
/// different algorithm than its issuer, so the embedded RSA root still
/// signs it. Deviation recorded in DESIGN.md.
fn mint_leaf(host: &str) -> Result<(String, String)> {
    let issuer_params =
        CertificateParams::from_ca_cert_pem(ROOT_CERT_PEM).context("parse embedded root cert")?;
    let issuer_key = KeyPair::from_pem(ROOT_KEY_PEM).context("parse embedded root key")?;
    let issuer_cert = issuer_params
        .self_signed(&issuer_key)
        .context("reconstruct root cert for signing")?;

    let leaf_key = KeyPair::generate().context("generate leaf key")?;

    let mut params = if let Ok(ip) = host.parse::<IpAddr>() {
        let mut p = CertificateParams::new(Vec::<String>::new()).context("create cert params")?;
        p.subject_alt_names = vec![rcgen::SanType::IpAddress(ip)];
        p.distinguished_name = DistinguishedName::new();
        p.distinguished_name
            .push(DnType::OrganizationName, DnValue::Utf8String("FREE".to_string()));
        p
    } else {
        let mut p =
            CertificateParams::new(vec![host.to_string()]).context("create cert params")?;
        p.distinguished_name = DistinguishedName::new();
        p.distinguished_name
            .push(DnType::OrganizationName, DnValue::Utf8String("FREE".to_string()));
        p.distinguished_name
            .push(DnType::CommonName, DnValue::Utf8String(host.to_string()));
        p
    };

    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now.saturating_add(time::Duration::days(365));

    let cert = params
        .signed_by(&leaf_key, &issuer_cert, &issuer_key)
        .context("sign leaf certificate")?;

    Ok((cert.pem(), leaf_key.serialize_pem()))
}

fn write_pair(cert_path: &Path, key_path: &Path, cert_pem: &str, key_pem: &str) -> Result<()> {
    let mut f = fs::File::create(cert_path)
        .with_context(|| format!("create {}", cert_path.display()))?;
    f.write_all(cert_pem.as_bytes())?;

    let mut f =
        fs::File::create(key_path).with_context(|| format!("create {}", key_path.display()))?;
    f.write_all(key_pem.as_bytes())?;
    Ok(())
}
