// 内容缓存
//
// 按字节预算与条目数预算约束的 LRU 缓存：
// - key 为内容哈希，相同负载只保留一份
// - 写入时按需压缩，超预算时从最久未访问的条目开始淘汰
// - 读取时惰性过期，另有后台定时清理
// - 按大小档位和标签关键词维护检索索引
// - 解码失败按未命中处理，条目被丢弃

pub mod codec;
pub mod index;

pub use codec::Codec;
pub use index::{tokenize, CacheQuery, SizeClass};

use crate::config::CacheConfig;
use crate::error::{CacheError, PublishError};
use crate::uploader::hasher::ContentHasher;
use chrono::{DateTime, Utc};
use index::SearchIndex;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 写入选项
#[derive(Debug, Clone, Default)]
pub struct CacheOptions {
    /// 不设置时使用默认 TTL
    pub ttl: Option<Duration>,
    /// 检索标签
    pub tags: Vec<String>,
}

impl CacheOptions {
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            tags: Vec::new(),
        }
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug)]
struct CacheEntry {
    value: Arc<Vec<u8>>,
    compressed: bool,
    created_at: DateTime<Utc>,
    expires_at: Instant,
    access_count: u64,
    last_accessed_at: DateTime<Utc>,
    size_bytes: u64,
    original_size_bytes: u64,
    tags: Vec<String>,
    tokens: Vec<String>,
    lru_tick: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }

    fn size_class(&self) -> SizeClass {
        SizeClass::from_size(self.original_size_bytes)
    }
}

/// 检索结果（条目元数据，不含值）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntryInfo {
    pub key: String,
    pub size_bytes: u64,
    pub original_size_bytes: u64,
    pub compressed: bool,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
    pub size_class: SizeClass,
}

/// 缓存统计
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub total_items: usize,
    pub total_memory: u64,
    /// 存储字节 / 原始字节，越小压缩效果越好
    pub compression_ratio: f64,
    pub evictions: u64,
    pub expirations: u64,
    pub decode_failures: u64,
    pub max_memory: u64,
    pub max_items: usize,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// LRU 顺序：tick 越小越久未访问
    lru: BTreeMap<u64, String>,
    tick: u64,
    total_memory: u64,
    original_memory: u64,
    index: SearchIndex,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
    decode_failures: u64,
}

impl CacheState {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.lru.remove(&entry.lru_tick);
        self.total_memory -= entry.size_bytes;
        self.original_memory -= entry.original_size_bytes;
        self.index.remove(key, entry.size_class(), &entry.tokens);
        Some(entry)
    }

    fn touch(&mut self, key: &str) {
        let tick = self.next_tick();
        if let Some(entry) = self.entries.get_mut(key) {
            self.lru.remove(&entry.lru_tick);
            entry.lru_tick = tick;
            entry.access_count += 1;
            entry.last_accessed_at = Utc::now();
            self.lru.insert(tick, key.to_string());
        }
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            self.remove(key);
        }
        self.expirations += expired.len() as u64;
        expired.len()
    }

    /// 淘汰最久未访问的条目，直到能放下 incoming 字节
    fn evict_for(&mut self, incoming: u64, max_memory: u64, max_items: usize) -> u64 {
        let mut evicted = 0;
        while !self.entries.is_empty()
            && (self.total_memory + incoming > max_memory || self.entries.len() + 1 > max_items)
        {
            let oldest = match self.lru.iter().next() {
                Some((_, key)) => key.clone(),
                None => break,
            };
            self.remove(&oldest);
            evicted += 1;
        }
        self.evictions += evicted;
        evicted
    }
}

/// 内容缓存
#[derive(Debug)]
pub struct ContentCache {
    state: Mutex<CacheState>,
    codec: Codec,
    max_memory: u64,
    max_items: usize,
    default_ttl: Duration,
}

impl ContentCache {
    pub fn new(max_memory: u64, max_items: usize, default_ttl: Duration) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            codec: Codec::disabled(),
            max_memory,
            max_items: max_items.max(1),
            default_ttl,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(
            config.max_memory_bytes,
            config.max_items,
            config.default_ttl(),
        )
        .with_codec(Codec::new(
            config.compression,
            config.compression_threshold_bytes,
            config.compression_level,
        ))
    }

    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    /// 内容哈希作为缓存 key
    pub fn content_key(bytes: &[u8]) -> String {
        ContentHasher::hash_bytes(bytes)
    }

    pub fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<String, CacheError> {
        self.set_with(
            key,
            value,
            CacheOptions {
                ttl,
                tags: Vec::new(),
            },
        )
    }

    /// 写入条目，返回 key
    pub fn set_with(
        &self,
        key: &str,
        value: &[u8],
        options: CacheOptions,
    ) -> Result<String, CacheError> {
        let encoded = self.codec.encode(value)?;
        let size_bytes = encoded.bytes.len() as u64;

        if size_bytes > self.max_memory {
            return Err(CacheError::EntryTooLarge {
                size: size_bytes,
                budget: self.max_memory,
            });
        }

        let ttl = options.ttl.unwrap_or(self.default_ttl);
        let now = Instant::now();
        let tokens = options
            .tags
            .iter()
            .flat_map(|tag| tokenize(tag))
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();

        let mut state = self.state.lock();
        state.remove(key);

        if state.total_memory + size_bytes > self.max_memory
            || state.entries.len() + 1 > self.max_items
        {
            // 优先清理已过期的条目，再按 LRU 淘汰
            state.purge_expired(now);
            let evicted = state.evict_for(size_bytes, self.max_memory, self.max_items);
            if evicted > 0 {
                debug!("缓存淘汰 {} 个条目以写入 {}", evicted, key);
            }
        }

        let tick = state.next_tick();
        let entry = CacheEntry {
            value: Arc::new(encoded.bytes),
            compressed: encoded.compressed,
            created_at: Utc::now(),
            expires_at: now + ttl,
            access_count: 0,
            last_accessed_at: Utc::now(),
            size_bytes,
            original_size_bytes: value.len() as u64,
            tags: options.tags,
            tokens,
            lru_tick: tick,
        };

        state.total_memory += entry.size_bytes;
        state.original_memory += entry.original_size_bytes;
        state
            .index
            .insert(key, entry.size_class(), &entry.tokens);
        state.lru.insert(tick, key.to_string());
        state.entries.insert(key.to_string(), entry);

        Ok(key.to_string())
    }

    /// 读取条目，过期或解码失败均视为未命中
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        match self.try_get(key) {
            Ok(value) => value,
            Err(e) => {
                warn!("{}，按未命中处理", e);
                None
            }
        }
    }

    /// 读取条目；解码失败时条目已被丢弃并计为未命中，错误交给调用方
    pub fn try_get(&self, key: &str) -> Result<Option<Vec<u8>>, PublishError> {
        let (stored, compressed) = {
            let mut state = self.state.lock();
            let now = Instant::now();

            let found = state
                .entries
                .get(key)
                .map(|entry| (entry.value.clone(), entry.compressed, entry.is_expired(now)));

            match found {
                None => {
                    state.misses += 1;
                    return Ok(None);
                }
                Some((_, _, true)) => {
                    state.remove(key);
                    state.expirations += 1;
                    state.misses += 1;
                    return Ok(None);
                }
                Some((value, compressed, false)) => {
                    state.touch(key);
                    (value, compressed)
                }
            }
        };

        match Codec::decode(&stored, compressed) {
            Ok(value) => {
                self.state.lock().hits += 1;
                Ok(Some(value))
            }
            Err(e) => {
                self.drop_undecodable(key, &stored);
                Err(PublishError::CacheDecodeFailure {
                    key: key.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// 丢弃无法解码的条目（仅当条目未被并发替换）
    fn drop_undecodable(&self, key: &str, stored: &Arc<Vec<u8>>) {
        let mut state = self.state.lock();
        let same = state
            .entries
            .get(key)
            .map(|entry| Arc::ptr_eq(&entry.value, stored))
            .unwrap_or(false);
        if same {
            state.remove(key);
        }
        state.decode_failures += 1;
        state.misses += 1;
    }

    pub fn has(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        let expired = match state.entries.get(key) {
            None => return false,
            Some(entry) => entry.is_expired(Instant::now()),
        };
        if expired {
            state.remove(key);
            state.expirations += 1;
        }
        !expired
    }

    pub fn delete(&self, key: &str) -> bool {
        self.state.lock().remove(key).is_some()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        let removed = state.entries.len();
        state.entries.clear();
        state.lru.clear();
        state.index.clear();
        state.total_memory = 0;
        state.original_memory = 0;
        info!("缓存已清空: {} 个条目", removed);
    }

    /// 清理所有已过期条目，返回清理数量
    pub fn purge_expired(&self) -> usize {
        self.state.lock().purge_expired(Instant::now())
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn memory_usage(&self) -> u64 {
        self.state.lock().total_memory
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let lookups = state.hits + state.misses;

        CacheStats {
            hits: state.hits,
            misses: state.misses,
            hit_rate: if lookups > 0 {
                state.hits as f64 / lookups as f64
            } else {
                0.0
            },
            total_items: state.entries.len(),
            total_memory: state.total_memory,
            compression_ratio: if state.original_memory > 0 {
                state.total_memory as f64 / state.original_memory as f64
            } else {
                1.0
            },
            evictions: state.evictions,
            expirations: state.expirations,
            decode_failures: state.decode_failures,
            max_memory: self.max_memory,
            max_items: self.max_items,
        }
    }

    /// 按关键词/大小档位检索，最近访问的排在前面
    pub fn search(&self, query: &CacheQuery) -> Vec<CacheEntryInfo> {
        let state = self.state.lock();
        let now = Instant::now();

        let keys: Vec<&String> = match state.index.candidates(query) {
            Some(candidates) => state
                .entries
                .keys()
                .filter(|key| candidates.contains(*key))
                .collect(),
            None => state.entries.keys().collect(),
        };

        let mut results: Vec<(u64, CacheEntryInfo)> = keys
            .into_iter()
            .filter_map(|key| {
                let entry = state.entries.get(key)?;
                if entry.is_expired(now) {
                    return None;
                }
                Some((
                    entry.lru_tick,
                    CacheEntryInfo {
                        key: key.clone(),
                        size_bytes: entry.size_bytes,
                        original_size_bytes: entry.original_size_bytes,
                        compressed: entry.compressed,
                        tags: entry.tags.clone(),
                        created_at: entry.created_at,
                        last_accessed_at: entry.last_accessed_at,
                        access_count: entry.access_count,
                        size_class: entry.size_class(),
                    },
                ))
            })
            .collect();

        results.sort_by(|a, b| b.0.cmp(&a.0));
        let limit = query.limit.unwrap_or(usize::MAX);
        results.into_iter().take(limit).map(|(_, info)| info).collect()
    }

    pub fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        options: CacheOptions,
    ) -> Result<String, CacheError> {
        let bytes = serde_json::to_vec(value).map_err(|e| CacheError::Encode(e.to_string()))?;
        self.set_with(key, &bytes, options)
    }

    /// 读取 JSON 记录，反序列化失败同样按未命中处理
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.try_get_json(key) {
            Ok(value) => value,
            Err(e) => {
                warn!("{}，按未命中处理", e);
                None
            }
        }
    }

    pub fn try_get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, PublishError> {
        let bytes = match self.try_get(key)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        serde_json::from_slice(&bytes).map(Some).map_err(|e| {
            let mut state = self.state.lock();
            state.remove(key);
            state.decode_failures += 1;
            // try_get 已经记了一次命中，这里改记为未命中
            state.hits = state.hits.saturating_sub(1);
            state.misses += 1;
            PublishError::CacheDecodeFailure {
                key: key.to_string(),
                reason: e.to_string(),
            }
        })
    }

    /// 启动后台过期清理任务
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // 第一次 tick 立即返回，跳过
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("缓存清理任务已停止");
                        break;
                    }
                    _ = ticker.tick() => {
                        let purged = self.purge_expired();
                        if purged > 0 {
                            info!("缓存过期清理: 移除 {} 个条目", purged);
                        }
                    }
                }
            }
        })
    }

    #[cfg(test)]
    fn corrupt(&self, key: &str) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(key) {
            entry.value = Arc::new(vec![0xff; entry.size_bytes as usize]);
            entry.compressed = true;
        }
    }
}
