use reqwest::Client;
use url::Url;

use super::{Announce, Response, URL_ENCODE_RESERVED};
use crate::error::tracker::Result;

/// An HTTP(S) tracker for a torrent, from which we can request peers and
/// to which we report transfer progress.
pub struct HttpTracker {
    /// The HTTP client (from `reqwest::Client`).
    client: Client,
    url: Url,
}

impl HttpTracker {
    pub fn new(url: Url) -> Self {
        HttpTracker {
            client: Client::new(),
            url,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Sends an announce request to the tracker with the specified
    /// parameters and parses the bencoded response.
    pub async fn announce(&self, params: Announce) -> Result<Response> {
        let mut query = vec![
            ("port", params.port.to_string()),
            ("downloaded", params.downloaded.to_string()),
            ("uploaded", params.uploaded.to_string()),
            ("left", params.left.to_string()),
            ("compact", "1".to_string()),
        ];

        if let Some(peer_count) = params.peer_count {
            query.push(("numwant", peer_count.to_string()));
        }
        if let Some(ip) = &params.ip {
            query.push(("ip", ip.to_string()));
        }
        if let Some(event) = params.event {
            query.push(("event", event.name().to_string()));
        }
        if let Some(tracker_id) = &params.tracker_id {
            query.push(("trackerid", tracker_id.clone()));
        }

        // the info hash and peer id are raw byte strings, which reqwest's
        // query serializer cannot produce, so they are appended by hand
        let url = format!(
            "{url}\
            ?info_hash={info_hash}\
            &peer_id={peer_id}",
            url = self.url,
            info_hash =
                percent_encoding::percent_encode(&params.info_hash, URL_ENCODE_RESERVED),
            peer_id =
                percent_encoding::percent_encode(&params.peer_id, URL_ENCODE_RESERVED)
        );

        let resp = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        let resp = serde_bencode::from_bytes(&resp)?;
        Ok(resp)
    }
}
