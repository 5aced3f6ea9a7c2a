use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// Key material for MESSAGE-INTEGRITY, either the short-term `pwd` from ICE
/// signaling or the long-term `MD5(username:realm:password)` TURN uses.
#[derive(Debug, Clone)]
pub enum Credentials {
    ShortTerm { pwd: String },
    LongTerm {
        username: String,
        realm: String,
        password: String,
    },
}

impl Credentials {
    pub fn short_term(pwd: impl Into<String>) -> Self {
        Self::ShortTerm { pwd: pwd.into() }
    }

    pub fn long_term(username: impl Into<String>, realm: impl Into<String>, password: impl Into<String>) -> Self {
        Self::LongTerm {
            username: username.into(),
            realm: realm.into(),
            password: password.into(),
        }
    }

    pub(crate) fn key(&self) -> Vec<u8> {
        match self {
            Credentials::ShortTerm { pwd } => pwd.as_bytes().to_vec(),
            Credentials::LongTerm {
                username,
                realm,
                password,
            } => {
                let mut hasher = Md5::new();
                hasher.update(format!("{username}:{realm}:{password}").as_bytes());
                hasher.finalize().to_vec()
            }
        }
    }
}

/// HMAC-SHA1 over `data`, used both to compute and to verify MESSAGE-INTEGRITY.
pub(crate) fn hmac_sha1(key: &[u8], data: &[u8]) -> [u8; 20] {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

const FINGERPRINT_XOR: u32 = 0x5354_554E;

/// CRC-32 (IEEE 802.3) of `data`, XORed with the FINGERPRINT magic constant.
pub(crate) fn fingerprint_crc32(data: &[u8]) -> u32 {
    const CRC: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
    CRC.checksum(data) ^ FINGERPRINT_XOR
}
