//! X.509 certificate chain extraction from a TLS server flight.
//!
//! The record layer is scanned tolerantly: record and message lengths are
//! clamped to what is actually buffered, only Certificate handshake messages
//! (type 0x0b) are descended into, and a certificate that fails to parse is
//! logged with the stage that failed and skipped without giving up on the
//! rest of the chain.

use crate::asn1;
use crate::bsb::Bsb;
use crate::Session;
use log::debug;
use serde::ser::{Serialize, Serializer};

/// One name component with its original string-type flag.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CertString {
    pub value: String,
    /// True when the source was a UTF8String (tag 12) rather than a
    /// printable/teletex string.
    pub utf8: bool,
}

impl Serialize for CertString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.value)
    }
}

/// Distinguished name, reduced to the indexed attributes.
#[derive(Clone, Debug, Default, Eq, PartialEq, serde::Serialize)]
pub struct CertDn {
    #[serde(rename = "cn")]
    pub common_names: Vec<CertString>,
    #[serde(rename = "on", skip_serializing_if = "Option::is_none")]
    pub org_name: Option<String>,
    #[serde(skip)]
    pub org_utf8: bool,
}

/// One certificate from the chain.
#[derive(Clone, Debug, Default, Eq, PartialEq, serde::Serialize)]
pub struct CertInfo {
    #[serde(serialize_with = "hex_bytes")]
    pub serial: Vec<u8>,
    pub issuer: CertDn,
    pub subject: CertDn,
    #[serde(rename = "alt")]
    pub alt_names: Vec<String>,
}

impl CertInfo {
    /// Session-level dedup identity: serial plus both DNs, alt names not
    /// considered.
    pub fn same_identity(&self, other: &CertInfo) -> bool {
        self.serial == other.serial && self.issuer == other.issuer && self.subject == other.subject
    }
}

fn hex_bytes<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    serializer.serialize_str(&out)
}

/// Scan a buffered half-stream for certificate chains and collect every
/// distinct certificate into the session.
pub(crate) fn process(session: &mut Session, data: &[u8]) {
    let mut sslbsb = Bsb::new(data);

    while sslbsb.remaining() > 5 {
        let ssldata = sslbsb.work_slice();
        let ssllen = (usize::from(ssldata[3]) << 8 | usize::from(ssldata[4]))
            .min(sslbsb.remaining() - 5);

        let mut pbsb = Bsb::new(&ssldata[5..5 + ssllen]);
        while pbsb.remaining() > 7 {
            let pdata = pbsb.work_slice();
            let plen =
                (usize::from(pdata[2]) << 8 | usize::from(pdata[3])).min(pbsb.remaining() - 4);

            if pdata[0] != 0x0b || plen < 3 {
                pbsb.skip(plen + 4);
                continue;
            }

            // Message body minus the 3-byte chain length
            let mut cbsb = Bsb::new(&pdata[7..4 + plen]);
            while cbsb.remaining() > 3 {
                let cdata = cbsb.work_slice();
                let clen = (usize::from(cdata[0]) << 16
                    | usize::from(cdata[1]) << 8
                    | usize::from(cdata[2]))
                .min(cbsb.remaining() - 3);

                match parse_certificate(&cdata[3..3 + clen]) {
                    Ok(cert) => {
                        if !session.certs.iter().any(|c| c.same_identity(&cert)) {
                            session.certs.push(cert);
                        }
                    }
                    Err(stage) => {
                        debug!("bad cert {} - {} bytes", stage, clen);
                        break;
                    }
                }

                cbsb.skip(clen + 3);
            }

            pbsb.skip(plen + 4);
        }

        sslbsb.skip(ssllen + 5);
    }
}

/// Parse one DER certificate. The error value is the stage (1..=10) whose
/// TLV failed to decode.
fn parse_certificate(data: &[u8]) -> Result<CertInfo, u8> {
    let mut cert = CertInfo::default();

    // Certificate
    let mut bsb = Bsb::new(data);
    let tlv = asn1::get_tlv(&mut bsb).ok_or(1u8)?;

    // tbsCertificate
    let mut bsb = Bsb::new(tlv.value);
    let tlv = asn1::get_tlv(&mut bsb).ok_or(2u8)?;

    let mut bsb = Bsb::new(tlv.value);

    // serialNumber, possibly preceded by an explicit version
    let mut tlv = asn1::get_tlv(&mut bsb).ok_or(3u8)?;
    if tlv.constructed {
        tlv = asn1::get_tlv(&mut bsb).ok_or(4u8)?;
    }
    cert.serial = tlv.value.to_vec();

    // signature algorithm
    asn1::get_tlv(&mut bsb).ok_or(5u8)?;

    // issuer
    let tlv = asn1::get_tlv(&mut bsb).ok_or(6u8)?;
    process_dn(&mut cert.issuer, &mut Bsb::new(tlv.value));

    // validity
    asn1::get_tlv(&mut bsb).ok_or(7u8)?;

    // subject
    let tlv = asn1::get_tlv(&mut bsb).ok_or(8u8)?;
    process_dn(&mut cert.subject, &mut Bsb::new(tlv.value));

    // subjectPublicKeyInfo
    asn1::get_tlv(&mut bsb).ok_or(9u8)?;

    // extensions
    if bsb.remaining() > 0 {
        let tlv = asn1::get_tlv(&mut bsb).ok_or(10u8)?;
        let mut last_oid = None;
        collect_alt_names(&mut cert, &mut Bsb::new(tlv.value), &mut last_oid);
    }

    Ok(cert)
}

/// Recursive descent over the RDN SEQUENCE/SET nesting of a DN.
fn process_dn(dn: &mut CertDn, bsb: &mut Bsb<'_>) {
    // The attribute OID and its value are siblings on the same level
    let mut last_oid: Option<String> = None;

    while bsb.remaining() > 0 {
        let tlv = match asn1::get_tlv(bsb) {
            Some(tlv) => tlv,
            None => return,
        };

        if tlv.constructed {
            process_dn(dn, &mut Bsb::new(tlv.value));
        } else if tlv.tag == 6 {
            last_oid = Some(asn1::decode_oid(tlv.value));
        } else if last_oid.is_some() && (tlv.tag == 20 || tlv.tag == 19 || tlv.tag == 12) {
            // 20 TeletexString, 19 PrintableString, 12 UTF8String
            match last_oid.as_deref() {
                Some("2.5.4.3") => {
                    let utf8 = tlv.tag == 12;
                    let value = if utf8 {
                        String::from_utf8_lossy(tlv.value).to_lowercase()
                    } else {
                        String::from_utf8_lossy(&tlv.value.to_ascii_lowercase()).into_owned()
                    };
                    dn.common_names.push(CertString { value, utf8 });
                }
                Some("2.5.4.10") => {
                    let value = String::from_utf8_lossy(tlv.value).into_owned();
                    if let Some(old) = &dn.org_name {
                        debug!("multiple orgName {} => {}", old, value);
                    } else {
                        dn.org_utf8 = tlv.tag == 12;
                        dn.org_name = Some(value);
                    }
                }
                _ => {}
            }
        }
    }
}

/// Walk the extension block looking for subjectAltName dNSName entries.
///
/// `last_oid` is shared across recursion levels: the OID and the OCTET
/// STRING carrying the encoded names are siblings, but the dNSName entries
/// sit one SEQUENCE deeper.
fn collect_alt_names(cert: &mut CertInfo, bsb: &mut Bsb<'_>, last_oid: &mut Option<String>) {
    while bsb.remaining() >= 2 {
        let tlv = match asn1::get_tlv(bsb) {
            Some(tlv) => tlv,
            None => return,
        };

        if tlv.constructed {
            collect_alt_names(cert, &mut Bsb::new(tlv.value), last_oid);
            if !cert.alt_names.is_empty() {
                return;
            }
        } else if tlv.tag == 6 {
            let oid = asn1::decode_oid(tlv.value);
            *last_oid = if oid == "2.5.29.17" { Some(oid) } else { None };
        } else if last_oid.is_some() && tlv.tag == 4 {
            collect_alt_names(cert, &mut Bsb::new(tlv.value), last_oid);
            return;
        } else if last_oid.is_some() && tlv.tag == 2 {
            cert.alt_names
                .push(String::from_utf8_lossy(&tlv.value.to_ascii_lowercase()).into_owned());
        }
    }
}
