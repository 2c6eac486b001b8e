//! CARP advertisement format and parsing.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Version| Type  | VirtualHostID |    AdvSkew    |    Auth Len   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    Demotion   |     AdvBase   |          Checksum             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         Counter (1)                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         Counter (2)                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     SHA-1 HMAC (5 words)                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use crate::error::PacketError;
use crate::types::{CARP_ADVERTISEMENT, CARP_AUTH_LEN, CARP_HEADER_LEN, CARP_SIG_LEN, CARP_VERSION};
use bytes::{BufMut, Bytes, BytesMut};

/// Byte offset of the checksum field
const CHECKSUM_OFFSET: usize = 6;

/// Byte offset of the counter field
const COUNTER_OFFSET: usize = 8;

/// Byte offset of the digest field
const DIGEST_OFFSET: usize = 16;

/// CARP advertisement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarpAdvertisement {
    /// Protocol version (4 bits, always 2)
    pub version: u8,

    /// Packet type (4 bits, always ADVERTISEMENT)
    pub kind: u8,

    /// Virtual host ID (1-255)
    pub vhid: u8,

    /// Sub-second skew, in 1/256 s; lower is preferred
    pub advskew: u8,

    /// Digest length in 32-bit words
    pub authlen: u8,

    /// Demotion weight of the sender
    pub demote: u8,

    /// Advertisement base interval in seconds
    pub advbase: u8,

    /// Ones' complement checksum over the whole advertisement
    pub checksum: u16,

    /// Anti-replay counter, carried as two big-endian 32-bit halves
    pub counter: u64,

    /// HMAC-SHA1 digest
    pub digest: [u8; CARP_SIG_LEN],
}

impl CarpAdvertisement {
    /// Create a new advertisement with an empty digest and checksum
    pub fn new(vhid: u8, advskew: u8, advbase: u8, demote: u8, counter: u64) -> Self {
        Self {
            version: CARP_VERSION,
            kind: CARP_ADVERTISEMENT,
            vhid,
            advskew,
            authlen: CARP_AUTH_LEN,
            demote,
            advbase,
            checksum: 0, // Set by set_checksum once the digest is in place
            counter,
            digest: [0; CARP_SIG_LEN],
        }
    }

    /// Parse an advertisement from raw bytes.
    ///
    /// The checksum is not verified here; see [`verify_checksum`](Self::verify_checksum).
    pub fn parse(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < CARP_HEADER_LEN {
            return Err(PacketError::Malformed("packet too short"));
        }

        let version = data[0] >> 4;
        let kind = data[0] & 0x0F;

        if version != CARP_VERSION {
            return Err(PacketError::Version(version));
        }

        if kind != CARP_ADVERTISEMENT {
            return Err(PacketError::Malformed("invalid packet type"));
        }

        let authlen = data[3];
        if authlen != CARP_AUTH_LEN {
            return Err(PacketError::Malformed("unsupported digest length"));
        }

        let hi = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
        let lo = u32::from_be_bytes([data[12], data[13], data[14], data[15]]);

        let mut digest = [0u8; CARP_SIG_LEN];
        digest.copy_from_slice(&data[DIGEST_OFFSET..CARP_HEADER_LEN]);

        Ok(Self {
            version,
            kind,
            vhid: data[1],
            advskew: data[2],
            authlen,
            demote: data[4],
            advbase: data[5],
            checksum: u16::from_be_bytes([data[6], data[7]]),
            counter: (u64::from(hi) << 32) | u64::from(lo),
            digest,
        })
    }

    /// Serialize to wire format
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(CARP_HEADER_LEN);

        buf.put_u8((self.version << 4) | (self.kind & 0x0F));
        buf.put_u8(self.vhid);
        buf.put_u8(self.advskew);
        buf.put_u8(self.authlen);
        buf.put_u8(self.demote);
        buf.put_u8(self.advbase);
        buf.put_u16(self.checksum);
        buf.put_u32((self.counter >> 32) as u32);
        buf.put_u32(self.counter as u32);
        buf.put_slice(&self.digest);

        buf.freeze()
    }

    /// Header fields covered by the digest, in wire order: everything
    /// before the checksum.
    pub fn authenticated_fields(&self) -> [u8; CHECKSUM_OFFSET] {
        [
            (self.version << 4) | (self.kind & 0x0F),
            self.vhid,
            self.advskew,
            self.authlen,
            self.demote,
            self.advbase,
        ]
    }

    /// Calculate the checksum over the serialized advertisement
    pub fn calculate_checksum(&self) -> u16 {
        internet_checksum(&self.to_bytes(), Some(CHECKSUM_OFFSET))
    }

    /// Set the checksum field
    pub fn set_checksum(&mut self) {
        self.checksum = self.calculate_checksum();
    }

    /// Verify the checksum of a raw advertisement
    pub fn verify_checksum(data: &[u8]) -> bool {
        if data.len() < CARP_HEADER_LEN {
            return false;
        }

        let stored = u16::from_be_bytes([data[CHECKSUM_OFFSET], data[CHECKSUM_OFFSET + 1]]);
        internet_checksum(&data[..CARP_HEADER_LEN], Some(CHECKSUM_OFFSET)) == stored
    }

    /// Byte range of the counter within the wire format
    pub const fn counter_range() -> std::ops::Range<usize> {
        COUNTER_OFFSET..DIGEST_OFFSET
    }
}

/// RFC 1071 ones' complement checksum, treating the 16-bit word at `skip`
/// (if any) as zero.
pub fn internet_checksum(data: &[u8], skip: Option<usize>) -> u16 {
    let mut sum: u32 = 0;
    let mut i = 0;

    while i < data.len() {
        if Some(i) == skip {
            i += 2;
            continue;
        }

        let word = if i + 1 < data.len() {
            u16::from_be_bytes([data[i], data[i + 1]])
        } else {
            u16::from_be_bytes([data[i], 0])
        };

        sum += u32::from(word);
        i += 2;
    }

    // Fold 32-bit sum to 16 bits
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}
