use super::Peer;
use crate::bencode::BencodeValue;
use crate::error::{LeechError, Result};
use std::net::IpAddr;

/// Parsed announce response
#[derive(Debug, Clone)]
pub struct TrackerResponse {
    /// Seconds to wait before re-announcing; parsed but otherwise unused,
    /// a leecher announces once per run
    pub interval: u64,
    /// Peers offered by the tracker
    pub peers: Vec<Peer>,
}

impl TrackerResponse {
    pub fn from_bencode(value: BencodeValue) -> Result<Self> {
        let dict = value
            .as_dict()
            .ok_or_else(|| LeechError::TrackerRejected("Response must be a dict".to_string()))?;

        if let Some(failure) = dict.get(b"failure reason".as_ref()) {
            let reason = failure.as_str().unwrap_or("Unknown failure").to_string();
            return Err(LeechError::TrackerRejected(reason));
        }

        let interval = dict
            .get(b"interval".as_ref())
            .and_then(|v| v.as_integer())
            .unwrap_or(0) as u64;

        // Peers arrive either as a compact string of 6-byte entries or as
        // a list of {ip, port} dicts; both forms are accepted
        let peers = match dict.get(b"peers".as_ref()) {
            Some(BencodeValue::String(compact)) => Peer::from_compact_list(compact),
            Some(BencodeValue::List(list)) => parse_peer_list(list)?,
            Some(_) => {
                return Err(LeechError::TrackerRejected(
                    "Invalid 'peers' format".to_string(),
                ));
            }
            None => {
                return Err(LeechError::TrackerRejected(
                    "Missing 'peers' field".to_string(),
                ));
            }
        };

        Ok(TrackerResponse { interval, peers })
    }
}

fn parse_peer_list(list: &[BencodeValue]) -> Result<Vec<Peer>> {
    let mut peers = Vec::new();

    for peer_value in list {
        let peer_dict = peer_value
            .as_dict()
            .ok_or_else(|| LeechError::TrackerRejected("Peer must be a dict".to_string()))?;

        let ip_str = peer_dict
            .get(b"ip".as_ref())
            .and_then(|v| v.as_str())
            .ok_or_else(|| LeechError::TrackerRejected("Missing peer 'ip'".to_string()))?;

        let ip: IpAddr = ip_str
            .parse()
            .map_err(|_| LeechError::TrackerRejected("Invalid peer IP address".to_string()))?;

        let port = peer_dict
            .get(b"port".as_ref())
            .and_then(|v| v.as_integer())
            .ok_or_else(|| LeechError::TrackerRejected("Missing peer 'port'".to_string()))?
            as u16;

        peers.push(Peer::new(ip, port));
    }

    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::decode;

    #[test]
    fn test_parse_compact_peers() {
        let mut body = b"d8:intervali900e5:peers12:".to_vec();
        body.extend_from_slice(&[127, 0, 0, 1, 0x1A, 0xE1, 10, 0, 0, 9, 0x1A, 0xE2]);
        body.push(b'e');

        let response = TrackerResponse::from_bencode(decode(&body).unwrap()).unwrap();
        assert_eq!(response.interval, 900);
        assert_eq!(response.peers.len(), 2);
        assert_eq!(response.peers[0].addr.to_string(), "127.0.0.1:6881");
        assert_eq!(response.peers[1].addr.to_string(), "10.0.0.9:6882");
    }

    #[test]
    fn test_parse_peer_dict_list() {
        let body = b"d8:intervali900e5:peersld2:ip9:127.0.0.14:porti6881eeee";
        let response = TrackerResponse::from_bencode(decode(body).unwrap()).unwrap();
        assert_eq!(response.peers.len(), 1);
        assert_eq!(response.peers[0].addr.to_string(), "127.0.0.1:6881");
    }

    #[test]
    fn test_failure_reason_is_rejection() {
        let body = b"d14:failure reason9:not todaye";
        match TrackerResponse::from_bencode(decode(body).unwrap()) {
            Err(LeechError::TrackerRejected(reason)) => assert_eq!(reason, "not today"),
            other => panic!("expected TrackerRejected, got {:?}", other.map(|_| ())),
        }
    }
}
