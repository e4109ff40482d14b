#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use matchfan_coordinator::{Coordinator, RemoteError, RemoteFetch, TaskOutcome};
use matchfan_core::config::Strictness;
use matchfan_core::{Config, ItemId, MatchOutcome, MatchSummary, PlayerHandle, SubjectId};
use matchfan_queue::{MemoryQueue, TaskQueue};
use matchfan_status::BroadcastHub;
use matchfan_store::MemoryStore;

pub const PUUID: &str = "puuid-faker";

/// Scripted remote: known players, each with a fixed match list.
pub struct FakeRemote {
    players: HashMap<(String, String), String>,
    items: HashMap<String, Vec<ItemId>>,
    scripted: Mutex<HashMap<ItemId, VecDeque<Result<MatchSummary, RemoteError>>>>,
    calls: Mutex<Vec<(ItemId, Instant)>>,
}

impl FakeRemote {
    /// Faker with `count` matches named `KR_1..`.
    pub fn with_items(count: usize) -> Self {
        Self {
            players: HashMap::new(),
            items: HashMap::new(),
            scripted: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
        .with_player("faker", "kr1", PUUID, "KR", count)
    }

    /// Add a player whose matches are named `{prefix}_1..`.
    pub fn with_player(
        mut self,
        name: &str,
        tag: &str,
        puuid: &str,
        prefix: &str,
        count: usize,
    ) -> Self {
        self.players
            .insert((name.to_lowercase(), tag.to_lowercase()), puuid.to_string());
        self.items.insert(
            puuid.to_string(),
            (1..=count).map(|i| format!("{prefix}_{i}")).collect(),
        );
        self
    }

    /// Queue responses for an item; once exhausted it succeeds.
    pub fn script(&self, item: &str, responses: Vec<Result<MatchSummary, RemoteError>>) {
        self.scripted
            .lock()
            .unwrap()
            .insert(item.to_string(), responses.into_iter().collect());
    }

    pub fn calls(&self) -> Vec<(ItemId, Instant)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, item: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|(id, _)| id == item).count()
    }
}

pub fn summary(item: &str) -> MatchSummary {
    let n: i64 = item
        .rsplit_once('_')
        .and_then(|(_, n)| n.parse().ok())
        .unwrap_or(0);
    MatchSummary {
        match_id: item.to_string(),
        timestamp: 1_700_000_000_000 + n * 1_000,
        outcome: if n % 2 == 0 { MatchOutcome::Win } else { MatchOutcome::Loss },
        champion: "Azir".into(),
        role: "MIDDLE".into(),
    }
}

#[async_trait]
impl RemoteFetch for FakeRemote {
    async fn resolve_identity(&self, handle: &PlayerHandle) -> Result<String, RemoteError> {
        self.players
            .get(&(handle.game_name.to_lowercase(), handle.tag_line.to_lowercase()))
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(format!("{handle}")))
    }

    async fn list_item_ids(
        &self,
        _region: &str,
        player_ref: &str,
        start: u32,
        count: u32,
    ) -> Result<Vec<ItemId>, RemoteError> {
        let items = self
            .items
            .get(player_ref)
            .ok_or_else(|| RemoteError::NotFound(player_ref.to_string()))?;
        Ok(items
            .iter()
            .skip(start as usize)
            .take(count as usize)
            .cloned()
            .collect())
    }

    async fn fetch_item(
        &self,
        _region: &str,
        item_id: &str,
        player_ref: &str,
    ) -> Result<MatchSummary, RemoteError> {
        assert!(self.items.contains_key(player_ref), "unknown player {player_ref}");
        self.calls.lock().unwrap().push((item_id.to_string(), Instant::now()));
        let scripted = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(item_id)
            .and_then(|q| q.pop_front());
        scripted.unwrap_or_else(|| Ok(summary(item_id)))
    }
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.api.ids_page_size = 2;
    config.rate.min_interval_ms = 1;
    config.fetch.timeout_ms = 1_000;
    config.fetch.max_retries = 2;
    config.fetch.backoff_base_ms = 5;
    config.fetch.backoff_max_ms = 20;
    config.job.lock_ttl_secs = 30;
    config.reconcile.stale_after_secs = 0;
    config.reconcile.max_resumes = 1;
    config.reconcile.strictness = Strictness::Trust;
    config.workers.count = 4;
    config.workers.poll_timeout_ms = 20;
    config.workers.heartbeat_secs = 1;
    config
}

pub struct Harness {
    pub coordinator: Coordinator,
    pub remote: Arc<FakeRemote>,
    pub queue: Arc<MemoryQueue>,
    pub hub: BroadcastHub,
}

pub fn harness(remote: FakeRemote) -> Harness {
    harness_with(remote, test_config())
}

pub fn harness_with(remote: FakeRemote, config: Config) -> Harness {
    let remote = Arc::new(remote);
    let queue = Arc::new(MemoryQueue::new());
    let hub = BroadcastHub::new();
    let coordinator = Coordinator::new(
        config,
        Arc::new(MemoryStore::new()),
        queue.clone(),
        remote.clone(),
        Arc::new(hub.clone()),
    );
    Harness {
        coordinator,
        remote,
        queue,
        hub,
    }
}

pub fn faker() -> PlayerHandle {
    PlayerHandle::new("Faker", "KR1", "kr")
}

pub fn faker_subject() -> SubjectId {
    faker().subject_id().unwrap()
}

pub fn chovy() -> PlayerHandle {
    PlayerHandle::new("Chovy", "KR2", "kr")
}

pub fn chovy_subject() -> SubjectId {
    chovy().subject_id().unwrap()
}

impl Harness {
    /// Handle queued tasks one at a time until the queue stays empty.
    pub async fn drain(&self) -> Vec<TaskOutcome> {
        let mut outcomes = Vec::new();
        while let Some(task) = self.queue.poll(Duration::from_millis(200)).await.unwrap() {
            outcomes.push(self.coordinator.worker.handle(task).await.unwrap());
        }
        outcomes
    }

    /// Handle exactly `n` tasks.
    pub async fn handle(&self, n: usize) -> Vec<TaskOutcome> {
        let mut outcomes = Vec::new();
        for _ in 0..n {
            let task = self.queue.poll(Duration::from_millis(200)).await.unwrap().unwrap();
            outcomes.push(self.coordinator.worker.handle(task).await.unwrap());
        }
        outcomes
    }

    /// Pull every queued task without processing it.
    pub async fn discard_queue(&self) -> usize {
        let mut n = 0;
        while self.queue.poll(Duration::from_millis(10)).await.unwrap().is_some() {
            n += 1;
        }
        n
    }
}
