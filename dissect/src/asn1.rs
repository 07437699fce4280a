//! Tolerant ASN.1 DER reader used for X.509 certificate dissection.
//!
//! Only the TLV layer and OBJECT IDENTIFIER decoding are implemented; the
//! certificate walker in [`crate::tls`] does its own recursive descent over
//! the values. Declared lengths that exceed the remaining input are clamped
//! rather than rejected, so truncated captures still yield partial records.

use crate::bsb::Bsb;

/// One decoded TLV.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Tlv<'a> {
    /// Constructed (true) or primitive (false) encoding.
    pub constructed: bool,
    pub tag: u32,
    pub value: &'a [u8],
}

/// Decode the next TLV from `bsb`.
///
/// Returns `None` on underflow or an indefinite length (0x80), leaving the
/// cursor wherever the failed read put it. The caller is expected to stop
/// walking the current level on `None`.
pub fn get_tlv<'a>(bsb: &mut Bsb<'a>) -> Option<Tlv<'a>> {
    if bsb.remaining() < 2 {
        return None;
    }

    let first = bsb.import_u8();
    let constructed = first & 0x20 != 0;

    let tag = if first & 0x1f == 0x1f {
        // High-tag-number form, base-128 with continuation bit
        let mut tag: u32 = 0;
        loop {
            let ch = bsb.import_u8();
            tag = tag << 7 | u32::from(ch & 0x7f);
            if ch & 0x80 == 0 {
                break;
            }
            if bsb.is_error() {
                return None;
            }
        }
        tag
    } else {
        u32::from(first & 0x1f)
    };

    let lenbyte = bsb.import_u8();
    if bsb.is_error() || lenbyte == 0x80 {
        return None;
    }

    let mut len = if lenbyte & 0x80 != 0 {
        let mut cnt = lenbyte & 0x7f;
        let mut len: usize = 0;
        while cnt > 0 && bsb.remaining() > 0 {
            len = len << 8 | usize::from(bsb.import_u8());
            cnt -= 1;
        }
        len
    } else {
        usize::from(lenbyte)
    };

    // Tolerant mode: clamp over-long declarations to what is actually there
    if len > bsb.remaining() {
        len = bsb.remaining();
    }

    let value = bsb.import_slice(len);
    if bsb.is_error() {
        return None;
    }

    Some(Tlv {
        constructed,
        tag,
        value,
    })
}

/// Decode an OBJECT IDENTIFIER value into its dotted-decimal form.
///
/// The first sub-identifier packs two components as `v / 40` and `v % 40`
/// when it is larger than 40.
pub fn decode_oid(oid: &[u8]) -> String {
    let mut out = String::new();
    let mut value: u64 = 0;
    let mut first = true;

    for &b in oid {
        value = value << 7 | u64::from(b & 0x7f);
        if b & 0x80 != 0 {
            continue;
        }

        if first {
            first = false;
            if value > 40 {
                out.push_str(&format!("{}.{}", value / 40, value % 40));
            } else {
                out.push_str(&format!("{}", value));
            }
        } else {
            out.push_str(&format!(".{}", value));
        }
        value = 0;
    }

    out
}
