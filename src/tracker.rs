//! Periodic HTTP announces to the torrent's tracker.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use bytes::Buf;
use percent_encoding::{percent_encode, AsciiSet, NON_ALPHANUMERIC};
use rand::Rng;
use reqwest::{Client, Url};
use serde::de;

use crate::{
    conf::CLIENT_ID_PREFIX,
    error::{Error, Result},
    PeerId, Sha1Hash,
};

/// All non-alphanumeric characters except `-._~` are percent encoded in the
/// query string.
const URL_ENCODE_RESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// The HTTP client announcing our download to the torrent's tracker.
///
/// The tracker keeps a register of all peers participating in the torrent;
/// announcing reports our progress and returns a fresh batch of peers to
/// connect to.
pub(crate) struct Tracker {
    client: Client,
    url: Url,
    info_hash: Sha1Hash,
    peer_id: PeerId,
    total_size: u64,
    port: u16,
}

impl Tracker {
    /// Creates a tracker client for the given announce URL. The Azureus
    /// style peer id is generated here, once, and reused for every announce
    /// and peer handshake.
    pub fn new(
        announce: &str,
        info_hash: Sha1Hash,
        total_size: u64,
        port: u16,
    ) -> Result<Self> {
        let url = Url::parse(announce).map_err(|e| {
            Error::Tracker(format!("invalid announce URL {}: {}", announce, e))
        })?;
        Ok(Self {
            client: Client::new(),
            url,
            info_hash,
            peer_id: generate_peer_id(),
            total_size,
            port,
        })
    }

    /// The peer id we announce with, also used in peer handshakes.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Announces our download statistics to the tracker and returns the
    /// decoded response. On the first announce of a download the `started`
    /// event is included.
    pub async fn announce(
        &self,
        first: bool,
        uploaded: u64,
        downloaded: u64,
    ) -> Result<Response> {
        // reqwest's query encoder would escape the percent signs of the
        // already encoded binary parameters, so these two are formatted into
        // the URL by hand
        let url = format!(
            "{url}?info_hash={info_hash}&peer_id={peer_id}",
            url = self.url,
            info_hash = percent_encode(&self.info_hash, URL_ENCODE_RESERVED),
            peer_id = percent_encode(&self.peer_id, URL_ENCODE_RESERVED),
        );

        let left = self.total_size.saturating_sub(downloaded);
        let mut query = vec![
            ("port", self.port.to_string()),
            ("uploaded", uploaded.to_string()),
            ("downloaded", downloaded.to_string()),
            ("left", left.to_string()),
            ("compact", "1".to_string()),
        ];
        if first {
            query.push(("event", "started".to_string()));
        }

        log::info!("Announcing to tracker {}", self.url);
        let resp = self.client.get(url.as_str()).query(&query).send().await?;
        if !resp.status().is_success() {
            return Err(Error::Tracker(format!(
                "tracker returned HTTP status {}",
                resp.status()
            )));
        }
        let body = resp.bytes().await?;

        // trackers report errors in a bencoded `failure reason` entry, with
        // the HTTP status still 200
        if let Ok(text) = std::str::from_utf8(&body) {
            if text.contains("failure") {
                return Err(Error::Tracker(text.to_string()));
            }
        }

        let resp: Response = serde_bencode::from_bytes(&body).map_err(|e| {
            Error::Tracker(format!("invalid announce response: {}", e))
        })?;
        if let Some(reason) = &resp.failure_reason {
            return Err(Error::Tracker(reason.clone()));
        }

        log::debug!(
            "Tracker has {} seeders and {} leechers, sent {} peers",
            resp.complete,
            resp.incomplete,
            resp.peers.len()
        );
        Ok(resp)
    }
}

/// The bencoded response to an announce.
#[derive(Debug, Deserialize, PartialEq)]
pub(crate) struct Response {
    /// Set when the tracker rejected the announce; no other field is
    /// meaningful in that case.
    #[serde(default, rename = "failure reason")]
    pub failure_reason: Option<String>,
    /// How many seconds to wait before the next announce.
    #[serde(default)]
    pub interval: u64,
    /// The number of peers that have the whole torrent, the seeders.
    #[serde(default)]
    pub complete: u64,
    /// The number of peers still downloading, the leechers.
    #[serde(default)]
    pub incomplete: u64,
    /// The peers to download from, from the compact 6 bytes per peer form.
    #[serde(default, deserialize_with = "deserialize_peers")]
    pub peers: Vec<SocketAddr>,
}

/// Generates the Azureus style client id: the fixed prefix followed by 12
/// random ASCII digits.
fn generate_peer_id() -> PeerId {
    let mut id = [0; 20];
    id[..8].copy_from_slice(CLIENT_ID_PREFIX);
    let mut rng = rand::thread_rng();
    for b in id[8..].iter_mut() {
        *b = rng.gen_range(b'0'..=b'9');
    }
    id
}

/// Decodes the compact peer list: 4 byte big endian IPv4 address and 2 byte
/// big endian port, per peer. The legacy list-of-dictionaries form is
/// rejected.
fn deserialize_peers<'de, D>(
    deserializer: D,
) -> std::result::Result<Vec<SocketAddr>, D::Error>
where
    D: de::Deserializer<'de>,
{
    struct PeersVisitor;

    impl<'de> de::Visitor<'de> for PeersVisitor {
        type Value = Vec<SocketAddr>;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("a compact peer byte string")
        }

        fn visit_bytes<E>(
            self,
            mut buf: &[u8],
        ) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            if buf.len() % 6 != 0 {
                return Err(de::Error::custom(
                    "compact peer list length must be a multiple of 6",
                ));
            }
            let mut peers = Vec::with_capacity(buf.len() / 6);
            while !buf.is_empty() {
                let ip = Ipv4Addr::from(buf.get_u32());
                let port = buf.get_u16();
                peers.push(SocketAddr::new(IpAddr::V4(ip), port));
            }
            Ok(peers)
        }

        fn visit_byte_buf<E>(
            self,
            buf: Vec<u8>,
        ) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            self.visit_bytes(&buf)
        }

        fn visit_seq<A>(
            self,
            _seq: A,
        ) -> std::result::Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            Err(de::Error::custom(
                "dictionary model peer lists are not supported",
            ))
        }
    }

    deserializer.deserialize_any(PeersVisitor)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_peer_id_shape() {
        let id = generate_peer_id();
        assert_eq!(&id[..8], CLIENT_ID_PREFIX);
        assert!(id[8..].iter().all(u8::is_ascii_digit));

        // ids are random, so two of them (almost certainly) differ
        assert_ne!(generate_peer_id()[8..], generate_peer_id()[8..]);
    }

    #[test]
    fn test_decode_compact_peers() {
        let mut body = Vec::new();
        body.extend_from_slice(
            b"d8:completei5e10:incompletei3e8:intervali1800e5:peers12:",
        );
        body.extend_from_slice(&[
            0x0a, 0x00, 0x00, 0x01, 0x1a, 0xe1, 0x0a, 0x00, 0x00, 0x02, 0x1a,
            0xe1,
        ]);
        body.push(b'e');

        let resp: Response = serde_bencode::from_bytes(&body).unwrap();
        assert_eq!(resp.failure_reason, None);
        assert_eq!(resp.interval, 1800);
        assert_eq!(resp.complete, 5);
        assert_eq!(resp.incomplete, 3);
        assert_eq!(
            resp.peers,
            vec![
                SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 6881),
                SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 6881),
            ]
        );
    }

    #[test]
    fn test_interval_defaults_to_zero() {
        let resp: Response =
            serde_bencode::from_bytes(b"d5:peers0:e").unwrap();
        assert_eq!(resp.interval, 0);
        assert!(resp.peers.is_empty());
    }

    #[test]
    fn test_reject_dictionary_model_peers() {
        let body =
            b"d5:peersld2:ip8:10.0.0.14:porti6881eeee".to_vec();
        assert!(serde_bencode::from_bytes::<Response>(&body).is_err());
    }

    #[tokio::test]
    async fn test_announce_roundtrip() {
        let mut body = Vec::new();
        body.extend_from_slice(b"d8:intervali900e5:peers6:");
        body.extend_from_slice(&[0x7f, 0x00, 0x00, 0x01, 0x1a, 0xe1]);
        body.push(b'e');
        let _m = mockito::mock("GET", "/announce")
            .match_query(mockito::Matcher::Any)
            .with_body(body)
            .create();

        let tracker = Tracker::new(
            &format!("{}/announce", mockito::server_url()),
            [0xab; 20],
            1000,
            6889,
        )
        .unwrap();
        let resp = tracker.announce(true, 0, 0).await.unwrap();
        assert_eq!(resp.interval, 900);
        assert_eq!(
            resp.peers,
            vec![SocketAddr::new(
                IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
                6881
            )]
        );
    }

    #[tokio::test]
    async fn test_announce_failure_reason() {
        let _m = mockito::mock("GET", "/announce")
            .match_query(mockito::Matcher::Any)
            .with_body(&b"d14:failure reason12:unregisterede"[..])
            .create();

        let tracker = Tracker::new(
            &format!("{}/announce", mockito::server_url()),
            [0xab; 20],
            1000,
            6889,
        )
        .unwrap();
        match tracker.announce(false, 0, 0).await {
            Err(Error::Tracker(reason)) => {
                assert!(reason.contains("unregistered"))
            }
            other => panic!("expected tracker failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_announce_http_error() {
        let _m = mockito::mock("GET", "/announce")
            .match_query(mockito::Matcher::Any)
            .with_status(503)
            .create();

        let tracker = Tracker::new(
            &format!("{}/announce", mockito::server_url()),
            [0xab; 20],
            1000,
            6889,
        )
        .unwrap();
        assert!(matches!(
            tracker.announce(false, 0, 0).await,
            Err(Error::Tracker(_))
        ));
    }
}
