//! Private key and CSR generation

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};

use rcgen::{string::Ia5String, CertificateParams, DistinguishedName, DnType, DnValue, KeyPair, SanType};

use crate::error::CertError;

/// Subject alternative names, split by kind
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sans {
    pub dns: Vec<String>,
    pub ips: Vec<String>,
}

impl Sans {
    /// Resolve SANs from an explicit list, falling back to `fqdn`
    ///
    /// Empty entries are dropped and duplicates removed (sorted for a stable
    /// CSR). Entries that are syntactically IPv4 addresses become IP SANs,
    /// everything else a DNS SAN.
    pub fn resolve<S: AsRef<str>>(requested: &[S], fqdn: &str) -> Self {
        let unique: BTreeSet<&str> = requested
            .iter()
            .map(|s| s.as_ref().trim())
            .filter(|s| !s.is_empty())
            .collect();

        let names: Vec<&str> = if unique.is_empty() {
            vec![fqdn]
        } else {
            unique.into_iter().collect()
        };

        let (ips, dns): (Vec<&str>, Vec<&str>) = names.into_iter().partition(|s| is_ipv4(s));
        Self {
            dns: dns.into_iter().map(str::to_string).collect(),
            ips: ips.into_iter().map(str::to_string).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.dns.len() + self.ips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stable text form, used to detect identity changes
    pub fn fingerprint(&self) -> String {
        format!("dns={};ip={}", self.dns.join(","), self.ips.join(","))
    }

    fn to_san_types(&self) -> Result<Vec<SanType>, CertError> {
        let mut out = Vec::with_capacity(self.len());
        for name in &self.dns {
            let name = Ia5String::try_from(name.clone())
                .map_err(|e| CertError::Csr(format!("invalid DNS name '{name}': {e}")))?;
            out.push(SanType::DnsName(name));
        }
        for ip in &self.ips {
            let addr: Ipv4Addr = ip
                .parse()
                .map_err(|e| CertError::Csr(format!("invalid IP address '{ip}': {e}")))?;
            out.push(SanType::IpAddress(IpAddr::V4(addr)));
        }
        Ok(out)
    }
}

/// Whether `value` is a dotted-quad IPv4 address
pub fn is_ipv4(value: &str) -> bool {
    value.parse::<Ipv4Addr>().is_ok()
}

/// Generate a new private key, PEM encoded
pub fn generate_private_key() -> Result<String, CertError> {
    let key_pair = KeyPair::generate().map_err(|e| CertError::KeyGeneration(e.to_string()))?;
    Ok(key_pair.serialize_pem())
}

/// Build a PEM CSR for `subject` and `sans`, signed with `private_key_pem`
pub fn generate_csr(private_key_pem: &str, subject: &str, sans: &Sans) -> Result<String, CertError> {
    let key_pair = KeyPair::from_pem(private_key_pem)
        .map_err(|e| CertError::Csr(format!("failed to load private key: {e}")))?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(subject.to_string()));
    params.distinguished_name = dn;
    params.subject_alt_names = sans.to_san_types()?;

    let csr = params
        .serialize_request(&key_pair)
        .map_err(|e| CertError::Csr(format!("failed to create CSR: {e}")))?;

    csr.pem()
        .map_err(|e| CertError::Csr(format!("failed to serialize CSR: {e}")))
}
