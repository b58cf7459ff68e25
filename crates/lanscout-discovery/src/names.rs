//! Service type and instance name handling.

use lanscout_core::{DiscoveryError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A service type such as `_airplay._tcp`.
///
/// Stored in its short form: no trailing dot and no `.local` domain. The short
/// form is the session key and the `protol` value of device payloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceType(String);

impl ServiceType {
    /// Normalizes `_svc._tcp`, `_svc._tcp.` and `_svc._tcp.local.` to the
    /// same short form.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim().trim_end_matches('.');
        let short = trimmed.strip_suffix(".local").unwrap_or(trimmed);

        if short.is_empty() || !short.starts_with('_') || short.split('.').count() < 2 {
            return Err(DiscoveryError::InvalidServiceType(raw.to_string()));
        }

        Ok(Self(short.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Fully qualified form used by the mDNS daemon, e.g. `_svc._tcp.local.`
    pub fn to_fqdn(&self, domain: &str) -> String {
        let domain = domain.trim_matches('.');
        if domain.is_empty() {
            format!("{}.local.", self.0)
        } else {
            format!("{}.{}.", self.0, domain)
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ServiceType {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Decodes DNS-SD label escapes.
///
/// `\DDD` (three decimal digits, value <= 255) becomes that byte and `\X`
/// becomes the literal character `X`. The decoded bytes are reassembled as
/// UTF-8, so multi-byte characters escaped byte by byte come back intact.
pub fn extract_instance_name(escaped: &str) -> String {
    let bytes = escaped.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' {
            if let Some(value) = decimal_escape(&bytes[i + 1..]) {
                out.push(value);
                i += 4;
                continue;
            }
            if let Some(&next) = bytes.get(i + 1) {
                if !next.is_ascii_digit() {
                    out.push(next);
                    i += 2;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

fn decimal_escape(rest: &[u8]) -> Option<u8> {
    let digits = rest.get(..3)?;
    if !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let value = digits
        .iter()
        .fold(0u32, |acc, d| acc * 10 + u32::from(d - b'0'));
    u8::try_from(value).ok()
}

/// Key used to correlate events for one instance inside a session.
pub fn instance_key(label: &str) -> String {
    extract_instance_name(label)
}

/// Strips `.<service type>...` from a fully qualified instance name.
///
/// The service type must occur past position 1; otherwise the full name is
/// returned untouched.
pub fn strip_service_type<'a>(full_name: &'a str, service_type: &str) -> &'a str {
    match full_name.find(service_type) {
        Some(pos) if pos > 1 => &full_name[..pos - 1],
        _ => full_name,
    }
}

/// Human readable instance name for a fully qualified name.
pub fn display_name(full_name: &str, service_type: &ServiceType) -> String {
    extract_instance_name(strip_service_type(full_name, service_type.as_str()))
}

/// Instance label of `full_name` within `fqdn` (`Inst1._svc._tcp.local.`
/// within `_svc._tcp.local.` gives `Inst1`).
pub fn instance_label<'a>(full_name: &'a str, fqdn: &str) -> &'a str {
    full_name
        .strip_suffix(fqdn)
        .and_then(|prefix| prefix.strip_suffix('.'))
        .unwrap_or(full_name)
}
