//! Identity extraction from X.509 certificates.
//!
//! Certificates issued for SRPC callers may carry two private extensions, each
//! a DER `SEQUENCE OF` string:
//!
//! - [`PERMITTED_METHODS_OID`]: `Service.Method` glob patterns the holder may
//!   call without asking the service
//! - [`GROUP_LIST_OID`]: groups the holder belongs to

use super::{AuthInformation, PermittedMethods};
use crate::error::{Error, Result};
use rustls::pki_types::CertificateDer;
use std::collections::BTreeSet;
use tracing::debug;
use x509_parser::der_parser::asn1_rs::{ToDer, Utf8String};
use x509_parser::der_parser::parse_der;
use x509_parser::prelude::*;

/// Extension listing permitted method patterns.
pub const PERMITTED_METHODS_OID: &str = "1.3.6.1.4.1.9586.100.7.1";

/// Extension listing group memberships.
pub const GROUP_LIST_OID: &str = "1.3.6.1.4.1.9586.100.7.2";

/// Arc form of [`PERMITTED_METHODS_OID`], as used by certificate builders.
pub const PERMITTED_METHODS_OID_ARCS: [u64; 10] = [1, 3, 6, 1, 4, 1, 9586, 100, 7, 1];

/// Arc form of [`GROUP_LIST_OID`].
pub const GROUP_LIST_OID_ARCS: [u64; 10] = [1, 3, 6, 1, 4, 1, 9586, 100, 7, 2];

/// The SRPC-relevant content of one certificate.
#[derive(Debug, Clone, Default)]
pub struct CertIdentity {
    /// Subject common name. Empty for CA certificates.
    pub username: String,
    pub groups: BTreeSet<String>,
    pub permitted_methods: BTreeSet<String>,
    pub is_ca: bool,
    /// DER encoding of the issuer name.
    pub raw_issuer: Vec<u8>,
    /// DER encoding of the subject name.
    pub raw_subject: Vec<u8>,
    /// Validity bounds as Unix timestamps.
    pub not_before: i64,
    pub not_after: i64,
}

impl CertIdentity {
    /// Parse a DER certificate.
    pub fn parse(der: &[u8]) -> Result<Self> {
        let (_, cert) =
            parse_x509_certificate(der).map_err(|e| Error::Certificate(e.to_string()))?;
        let is_ca = cert.is_ca();
        let username = if is_ca {
            String::new()
        } else {
            cert.subject()
                .iter_common_name()
                .next()
                .and_then(|cn| cn.as_str().ok())
                .unwrap_or_default()
                .to_string()
        };
        let mut identity = CertIdentity {
            username,
            is_ca,
            raw_issuer: cert.issuer().as_raw().to_vec(),
            raw_subject: cert.subject().as_raw().to_vec(),
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            ..Default::default()
        };
        for ext in cert.extensions() {
            match ext.oid.to_id_string().as_str() {
                PERMITTED_METHODS_OID => {
                    identity.permitted_methods = decode_string_list(ext.value)?.into_iter().collect();
                }
                GROUP_LIST_OID => {
                    identity.groups = decode_string_list(ext.value)?.into_iter().collect();
                }
                _ => {}
            }
        }
        Ok(identity)
    }

    /// Whether the certificate grants every method.
    pub fn is_admin(&self) -> bool {
        self.permitted_methods.contains("*.*")
    }
}

/// Derives connection identity from a verified peer chain.
#[derive(Debug, Clone, Default)]
pub struct Authenticator {
    /// Raw subjects of the CAs whose certificates may carry method powers.
    /// `None` trusts method powers from every verified chain.
    full_auth_subjects: Option<Vec<Vec<u8>>>,
}

impl Authenticator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only honor permitted-method extensions on leaves issued by one of
    /// these CA certificates.
    pub fn with_full_auth_cas(cas: &[CertificateDer<'_>]) -> Result<Self> {
        let subjects = cas
            .iter()
            .map(|ca| CertIdentity::parse(ca.as_ref()).map(|id| id.raw_subject))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            full_auth_subjects: Some(subjects),
        })
    }

    pub fn restricts_method_powers(&self) -> bool {
        self.full_auth_subjects.is_some()
    }

    /// Compute the identity for a connection. `chain` is leaf first; an empty
    /// chain yields an anonymous caller with no built-in rights.
    pub fn authenticate(
        &self,
        chain: &[CertificateDer<'_>],
        allow_method_powers: bool,
    ) -> Result<(AuthInformation, PermittedMethods)> {
        if chain.is_empty() {
            return Ok((AuthInformation::anonymous(), PermittedMethods::none()));
        }
        let identities = chain
            .iter()
            .map(|der| CertIdentity::parse(der.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        let trust_cert_methods = match &self.full_auth_subjects {
            None => true,
            Some(subjects) => subjects.iter().any(|s| *s == identities[0].raw_issuer),
        };
        let mut auth = AuthInformation::anonymous();
        let mut patterns = BTreeSet::new();
        for identity in &identities {
            if auth.username.is_empty() {
                auth.username = identity.username.clone();
            }
            if auth.group_list.is_empty() {
                auth.group_list = identity.groups.clone();
            }
            if allow_method_powers && trust_cert_methods {
                patterns.extend(identity.permitted_methods.iter().cloned());
            }
        }
        debug!(
            username = %auth.username,
            groups = auth.group_list.len(),
            permitted_methods = patterns.len(),
            trust_cert_methods,
            "authenticated peer"
        );
        Ok((auth, PermittedMethods::Patterns(patterns)))
    }
}

/// Encode strings as a DER `SEQUENCE OF UTF8String`.
pub fn encode_string_list<S: AsRef<str>>(items: &[S]) -> Result<Vec<u8>> {
    let strings: Vec<Utf8String<'_>> = items
        .iter()
        .map(|item| Utf8String::new(item.as_ref()))
        .collect();
    strings
        .to_der_vec()
        .map_err(|e| Error::Certificate(format!("encoding string list: {e}")))
}

/// Decode a DER `SEQUENCE OF` string. Any ASN.1 string type is accepted
/// for the items.
pub fn decode_string_list(der: &[u8]) -> Result<Vec<String>> {
    let (rest, object) = parse_der(der)
        .map_err(|e| Error::Certificate(format!("malformed string list: {e}")))?;
    if !rest.is_empty() {
        return Err(Error::Certificate("trailing data after SEQUENCE".into()));
    }
    let items = object.as_sequence().map_err(|_| {
        Error::Certificate(format!("expected SEQUENCE, found {:?}", object.tag()))
    })?;
    items
        .iter()
        .map(|item| {
            item.as_str().map(str::to_string).map_err(|_| {
                Error::Certificate(format!("expected a string, found {:?}", item.tag()))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_list_encoding_matches_der() {
        let der = encode_string_list(&["ab"]).unwrap();
        assert_eq!(der, vec![0x30, 0x04, 0x0c, 0x02, b'a', b'b']);
        assert_eq!(encode_string_list::<&str>(&[]).unwrap(), vec![0x30, 0x00]);
    }

    #[test]
    fn test_string_list_decodes_mixed_tags() {
        let items = vec!["Hypervisor.*".to_string(), "ImageServer.GetImage".to_string()];
        let der = encode_string_list(&items).unwrap();
        assert_eq!(decode_string_list(&der).unwrap(), items);

        // PrintableString then IA5String, as other issuers write them.
        let mixed = [
            0x30, 0x0a, 0x13, 0x03, b'd', b'e', b'v', 0x16, 0x03, b'o', b'p', b's',
        ];
        assert_eq!(
            decode_string_list(&mixed).unwrap(),
            vec!["dev".to_string(), "ops".to_string()]
        );
    }

    #[test]
    fn test_long_lists_use_long_form_lengths() {
        let items: Vec<String> = (0..64).map(|i| format!("Service{i}.Method")).collect();
        let der = encode_string_list(&items).unwrap();
        assert_eq!(der[1] & 0x80, 0x80);
        assert_eq!(decode_string_list(&der).unwrap(), items);
    }

    #[test]
    fn test_malformed_lists_are_rejected() {
        assert!(decode_string_list(&[]).is_err());
        assert!(decode_string_list(&[0x31, 0x00]).is_err());
        assert!(decode_string_list(&[0x30, 0x05, 0x13, 0x02]).is_err());
        assert!(decode_string_list(&[0x30, 0x03, 0x02, 0x01, 0x05]).is_err());
        assert!(decode_string_list(&[0x30, 0x00, 0x00]).is_err());
    }

    #[test]
    fn test_empty_chain_is_anonymous() {
        let (auth, perms) = Authenticator::new().authenticate(&[], true).unwrap();
        assert!(auth.is_anonymous());
        assert!(perms.is_empty());
    }
}
