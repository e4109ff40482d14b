//! HTTP client for the Riot account and match APIs.

use std::time::Duration;

use async_trait::async_trait;
use matchfan_core::config::{ApiConfig, FetchConfig, RateConfig};
use matchfan_core::{regional_route, ItemId, MatchOutcome, MatchSummary, PlayerHandle};
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::debug;

use crate::remote::{RemoteError, RemoteFetch};

const TOKEN_HEADER: &str = "X-Riot-Token";

/// Calls `https://{route}.api.riotgames.com` with the configured API key.
#[derive(Clone)]
#[cfg_attr(test, derive(Debug))]
pub struct RiotClient {
    client: reqwest::Client,
    api_key: String,
    queue_id: u32,
    default_backoff: Duration,
    /// Replaces `https://{route}.api.riotgames.com` when set (proxies, mocks).
    base_url: Option<String>,
}

impl RiotClient {
    pub fn new(
        api: &ApiConfig,
        fetch: &FetchConfig,
        rate: &RateConfig,
    ) -> Result<Self, RemoteError> {
        let api_key = api
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| RemoteError::Fatal("RIOT_API_KEY is not set".into()))?;
        let client = reqwest::Client::builder()
            .timeout(fetch.timeout())
            .build()
            .map_err(|e| RemoteError::Fatal(format!("http client: {e}")))?;
        Ok(Self {
            client,
            api_key,
            queue_id: api.queue_id,
            default_backoff: rate.default_backoff(),
            base_url: None,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into().trim_end_matches('/').to_string());
        self
    }

    fn host(&self, region: &str) -> Result<String, RemoteError> {
        if let Some(base) = &self.base_url {
            return Ok(base.clone());
        }
        let route = regional_route(region).map_err(|e| RemoteError::NotFound(e.to_string()))?;
        Ok(format!("https://{route}.api.riotgames.com"))
    }

    async fn get_json(&self, url: &str) -> Result<Value, RemoteError> {
        let response = self
            .client
            .get(url)
            .header(TOKEN_HEADER, &self.api_key)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(classify_status(status, retry_after, self.default_backoff, url));
        }

        response.json::<Value>().await.map_err(|e| {
            if e.is_timeout() {
                RemoteError::Transient(format!("timed out reading body: {e}"))
            } else {
                RemoteError::Fatal(format!("malformed body: {e}"))
            }
        })
    }
}

fn classify_transport(e: reqwest::Error) -> RemoteError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        RemoteError::Transient(e.to_string())
    } else {
        RemoteError::Fatal(e.to_string())
    }
}

/// Map a non-success HTTP status to a retry class.
pub fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    default_backoff: Duration,
    url: &str,
) -> RemoteError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => RemoteError::RateLimited {
            retry_after: Some(retry_after.unwrap_or(default_backoff)),
        },
        StatusCode::NOT_FOUND => RemoteError::NotFound(url.to_string()),
        s if s.is_server_error() => RemoteError::Transient(format!("{s} from {url}")),
        s => RemoteError::Fatal(format!("{s} from {url}")),
    }
}

/// Pull the player's row out of a match document.
pub fn extract_summary(
    match_id: &str,
    body: &Value,
    puuid: &str,
) -> Result<MatchSummary, RemoteError> {
    let info = body
        .get("info")
        .ok_or_else(|| RemoteError::Fatal(format!("{match_id}: missing info")))?;
    let timestamp = info
        .get("gameCreation")
        .and_then(Value::as_i64)
        .ok_or_else(|| RemoteError::Fatal(format!("{match_id}: missing gameCreation")))?;
    let participant = info
        .get("participants")
        .and_then(Value::as_array)
        .and_then(|ps| ps.iter().find(|p| p.get("puuid").and_then(Value::as_str) == Some(puuid)))
        .ok_or_else(|| RemoteError::Fatal(format!("{match_id}: player not among participants")))?;

    let win = participant
        .get("win")
        .and_then(Value::as_bool)
        .ok_or_else(|| RemoteError::Fatal(format!("{match_id}: missing win flag")))?;
    let text = |field: &str| {
        participant
            .get(field)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RemoteError::Fatal(format!("{match_id}: missing {field}")))
    };

    Ok(MatchSummary {
        match_id: match_id.to_string(),
        timestamp,
        outcome: if win { MatchOutcome::Win } else { MatchOutcome::Loss },
        champion: text("championName")?,
        role: text("teamPosition")?,
    })
}

#[async_trait]
impl RemoteFetch for RiotClient {
    #[tracing::instrument(level = "debug", skip(self), fields(handle = %handle))]
    async fn resolve_identity(&self, handle: &PlayerHandle) -> Result<String, RemoteError> {
        let url = format!(
            "{}/riot/account/v1/accounts/by-riot-id/{}/{}",
            self.host(&handle.region)?,
            handle.game_name.trim(),
            handle.tag_line.trim()
        );
        let body = self.get_json(&url).await?;
        body.get("puuid")
            .and_then(Value::as_str)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .ok_or_else(|| RemoteError::NotFound(format!("no puuid for {handle}")))
    }

    #[tracing::instrument(level = "debug", skip(self, player_ref))]
    async fn list_item_ids(
        &self,
        region: &str,
        player_ref: &str,
        start: u32,
        count: u32,
    ) -> Result<Vec<ItemId>, RemoteError> {
        let url = format!(
            "{}/lol/match/v5/matches/by-puuid/{}/ids?queue={}&start={}&count={}",
            self.host(region)?,
            player_ref,
            self.queue_id,
            start,
            count
        );
        let body = self.get_json(&url).await?;
        let ids: Vec<ItemId> =
            serde_json::from_value(body)
                .map_err(|e| RemoteError::Fatal(format!("match id page: {e}")))?;
        debug!(start, count, got = ids.len(), "match id page");
        Ok(ids)
    }

    #[tracing::instrument(level = "debug", skip(self, player_ref))]
    async fn fetch_item(
        &self,
        region: &str,
        item_id: &str,
        player_ref: &str,
    ) -> Result<MatchSummary, RemoteError> {
        let url = format!("{}/lol/match/v5/matches/{}", self.host(region)?, item_id);
        let body = self.get_json(&url).await?;
        extract_summary(item_id, &body, player_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn match_doc() -> Value {
        json!({
            "metadata": {"matchId": "EUW1_1"},
            "info": {
                "gameCreation": 1_700_000_000_000i64,
                "participants": [
                    {
                        "puuid": "other",
                        "win": false,
                        "championName": "Zed",
                        "teamPosition": "MIDDLE"
                    },
                    {"puuid": "me", "win": true, "championName": "Ahri", "teamPosition": "MIDDLE"}
                ]
            }
        })
    }

    #[test]
    fn extracts_the_players_row() {
        let summary = extract_summary("EUW1_1", &match_doc(), "me").unwrap();
        assert_eq!(summary.outcome, MatchOutcome::Win);
        assert_eq!(summary.champion, "Ahri");
        assert_eq!(summary.timestamp, 1_700_000_000_000);
    }

    #[test]
    fn absent_participant_is_fatal() {
        assert!(matches!(
            extract_summary("EUW1_1", &match_doc(), "nobody"),
            Err(RemoteError::Fatal(_))
        ));
        assert!(matches!(
            extract_summary("EUW1_1", &json!({"oops": 1}), "me"),
            Err(RemoteError::Fatal(_))
        ));
    }

    #[test]
    fn status_classification() {
        let backoff = Duration::from_secs(10);
        assert_eq!(
            classify_status(
                StatusCode::TOO_MANY_REQUESTS,
                Some(Duration::from_secs(3)),
                backoff,
                "u"
            ),
            RemoteError::RateLimited { retry_after: Some(Duration::from_secs(3)) }
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, None, backoff, "u"),
            RemoteError::RateLimited { retry_after: Some(backoff) }
        );
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, None, backoff, "u"),
            RemoteError::NotFound(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, None, backoff, "u"),
            RemoteError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, None, backoff, "u"),
            RemoteError::Fatal(_)
        ));
    }

    #[test]
    fn client_requires_api_key() {
        let err = RiotClient::new(
            &ApiConfig::default(),
            &FetchConfig::default(),
            &RateConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, RemoteError::Fatal(_)));
    }
}
