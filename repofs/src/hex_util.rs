//! Hex string helpers for displaying MD5/SHA1 digests.

pub fn encode_hex(data: &[u8]) -> String {
    hex::encode(data)
}

pub fn decode_hex(data: impl AsRef<[u8]>) -> Option<Vec<u8>> {
    hex::decode(data.as_ref()).ok()
}
