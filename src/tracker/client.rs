use super::{TrackerRequest, TrackerResponse};
use crate::bencode::decode;
use crate::error::{LeechError, Result};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info, warn};

const TRACKER_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP announce client
pub struct TrackerClient {
    client: Client,
}

impl TrackerClient {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(TRACKER_TIMEOUT)
            .build()
            .expect("default reqwest client");

        Self { client }
    }

    /// Announce to a tracker and return its peer list.
    ///
    /// An empty peer list is an error: a leecher with nobody to talk to
    /// cannot make progress.
    pub async fn announce(
        &self,
        tracker_url: &str,
        request: &TrackerRequest,
    ) -> Result<TrackerResponse> {
        info!("Announcing to tracker: {}", tracker_url);

        // The query is appended pre-encoded; see TrackerRequest::to_query_string
        let separator = if tracker_url.contains('?') { '&' } else { '?' };
        let url = format!("{}{}{}", tracker_url, separator, request.to_query_string());

        debug!("Tracker request URL: {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| LeechError::TrackerUnreachable(e.to_string()))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| LeechError::TrackerUnreachable(e.to_string()))?;

        if !status.is_success() {
            return Err(LeechError::TrackerUnreachable(format!(
                "HTTP status {}",
                status
            )));
        }

        let tracker_response = TrackerResponse::from_bencode(decode(&body)?)?;
        if tracker_response.peers.is_empty() {
            return Err(LeechError::NoPeers);
        }

        info!(
            "Received {} peers from tracker (interval: {}s)",
            tracker_response.peers.len(),
            tracker_response.interval
        );

        Ok(tracker_response)
    }

    /// Try each tracker in order; the first successful announce wins.
    ///
    /// Returns the winning tracker URL alongside its response, so the
    /// magnet path can record which tracker actually supplied peers.
    pub async fn announce_any(
        &self,
        trackers: &[String],
        request: &TrackerRequest,
    ) -> Result<(String, TrackerResponse)> {
        let mut last_error = LeechError::TrackerUnreachable("No trackers to try".to_string());

        for tracker_url in trackers {
            match self.announce(tracker_url, request).await {
                Ok(response) => return Ok((tracker_url.clone(), response)),
                Err(err) => {
                    warn!("Tracker {} failed: {}", tracker_url, err);
                    last_error = err;
                }
            }
        }

        Err(last_error)
    }
}

impl Default for TrackerClient {
    fn default() -> Self {
        Self::new()
    }
}
