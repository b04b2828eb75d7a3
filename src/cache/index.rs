// 缓存检索索引
//
// 按大小档位和关键词维护反向索引，插入/删除时增量更新

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// 大小档位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeClass {
    /// < 1KiB
    Tiny,
    /// < 64KiB
    Small,
    /// < 1MiB
    Medium,
    Large,
}

impl SizeClass {
    pub fn from_size(bytes: u64) -> Self {
        match bytes {
            0..=1023 => SizeClass::Tiny,
            1024..=65_535 => SizeClass::Small,
            65_536..=1_048_575 => SizeClass::Medium,
            _ => SizeClass::Large,
        }
    }
}

/// 检索条件
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheQuery {
    /// 关键词（全部命中才算匹配）
    #[serde(default)]
    pub text: Option<String>,
    /// 原始大小档位
    #[serde(default)]
    pub size_class: Option<SizeClass>,
    /// 最多返回条数
    #[serde(default)]
    pub limit: Option<usize>,
}

impl CacheQuery {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }
}

/// 切分关键词：小写、按非字母数字切分
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect();
    tokens.sort();
    tokens.dedup();
    tokens
}

#[derive(Debug, Default)]
pub struct SearchIndex {
    by_size: HashMap<SizeClass, HashSet<String>>,
    by_token: HashMap<String, HashSet<String>>,
}

impl SearchIndex {
    pub fn insert(&mut self, key: &str, size_class: SizeClass, tokens: &[String]) {
        self.by_size
            .entry(size_class)
            .or_default()
            .insert(key.to_string());
        for token in tokens {
            self.by_token
                .entry(token.clone())
                .or_default()
                .insert(key.to_string());
        }
    }

    pub fn remove(&mut self, key: &str, size_class: SizeClass, tokens: &[String]) {
        if let Some(keys) = self.by_size.get_mut(&size_class) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_size.remove(&size_class);
            }
        }
        for token in tokens {
            if let Some(keys) = self.by_token.get_mut(token) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_token.remove(token);
                }
            }
        }
    }

    /// 返回满足条件的 key 集合，None 表示没有任何过滤条件
    pub fn candidates(&self, query: &CacheQuery) -> Option<HashSet<String>> {
        let mut result: Option<HashSet<String>> = None;

        if let Some(class) = query.size_class {
            result = Some(self.by_size.get(&class).cloned().unwrap_or_default());
        }

        if let Some(text) = &query.text {
            for token in tokenize(text) {
                let keys = self.by_token.get(&token).cloned().unwrap_or_default();
                result = Some(match result {
                    Some(current) => current.intersection(&keys).cloned().collect(),
                    None => keys,
                });
            }
        }

        result
    }

    pub fn clear(&mut self) {
        self.by_size.clear();
        self.by_token.clear();
    }

    pub fn token_count(&self) -> usize {
        self.by_token.len()
    }
}
