use crate::error::{LeechError, Result};
use url::Url;

/// A parsed magnet URI: the torrent's identity without its info dictionary.
///
/// Format: `magnet:?xt=urn:btih:<hash>&dn=<name>&tr=<url>...`
#[derive(Debug, Clone)]
pub struct Magnet {
    /// SHA1 info hash from the `xt` parameter
    pub info_hash: [u8; 20],
    /// Suggested display name, if present
    pub display_name: Option<String>,
    /// Tracker URLs, in the order they appear
    pub trackers: Vec<String>,
}

impl Magnet {
    pub fn parse(uri: &str) -> Result<Self> {
        let uri = uri.trim();
        if !uri.starts_with("magnet:?") {
            return Err(LeechError::InvalidMagnet(
                "Missing magnet:? prefix".to_string(),
            ));
        }

        let url = Url::parse(uri).map_err(|e| LeechError::InvalidMagnet(e.to_string()))?;

        let mut xt = None;
        let mut display_name = None;
        let mut trackers = Vec::new();

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => xt = Some(value.into_owned()),
                "dn" => display_name = Some(value.into_owned()),
                "tr" => trackers.push(value.into_owned()),
                _ => {}
            }
        }

        let xt = xt.ok_or_else(|| LeechError::InvalidMagnet("Missing xt parameter".to_string()))?;
        let topic = xt
            .strip_prefix("urn:btih:")
            .ok_or_else(|| LeechError::InvalidMagnet("xt is not a urn:btih topic".to_string()))?;

        // Hex info hashes are 40 characters, base32 ones are 32
        let decoded = match topic.len() {
            40 => hex::decode(topic)
                .map_err(|_| LeechError::InvalidMagnet("Invalid hex info hash".to_string()))?,
            32 => base32_decode(topic)
                .ok_or_else(|| LeechError::InvalidMagnet("Invalid base32 info hash".to_string()))?,
            other => {
                return Err(LeechError::InvalidMagnet(format!(
                    "Info hash has {} characters, expected 40 or 32",
                    other
                )));
            }
        };

        let mut info_hash = [0u8; 20];
        if decoded.len() != 20 {
            return Err(LeechError::InvalidMagnet(
                "Info hash does not decode to 20 bytes".to_string(),
            ));
        }
        info_hash.copy_from_slice(&decoded);

        Ok(Magnet {
            info_hash,
            display_name,
            trackers,
        })
    }
}

/// RFC 4648 base32 without padding, as used for older btih topics
fn base32_decode(input: &str) -> Option<Vec<u8>> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

    let input = input.to_uppercase();
    let mut output = Vec::with_capacity(input.len() * 5 / 8);
    let mut buffer: u64 = 0;
    let mut bits = 0;

    for c in input.bytes() {
        let value = ALPHABET.iter().position(|&x| x == c)? as u64;
        buffer = (buffer << 5) | value;
        bits += 5;

        if bits >= 8 {
            bits -= 8;
            output.push((buffer >> bits) as u8);
            buffer &= (1 << bits) - 1;
        }
    }

    Some(output)
}
