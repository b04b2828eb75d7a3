// 缓存值压缩
//
// 使用 deflate 压缩，只有压缩后确实更小时才保存压缩结果

use crate::error::CacheError;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// 编码后的缓存值
#[derive(Debug)]
pub struct Encoded {
    pub bytes: Vec<u8>,
    pub compressed: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct Codec {
    enabled: bool,
    threshold: usize,
    level: u32,
}

impl Codec {
    pub fn new(enabled: bool, threshold: usize, level: u32) -> Self {
        Self {
            enabled,
            threshold,
            level: level.min(9),
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, usize::MAX, 0)
    }

    pub fn encode(&self, raw: &[u8]) -> Result<Encoded, CacheError> {
        if !self.enabled || raw.len() < self.threshold {
            return Ok(Encoded {
                bytes: raw.to_vec(),
                compressed: false,
            });
        }

        let mut encoder = DeflateEncoder::new(
            Vec::with_capacity(raw.len() / 2),
            Compression::new(self.level),
        );
        encoder
            .write_all(raw)
            .map_err(|e| CacheError::Encode(e.to_string()))?;
        let compressed = encoder
            .finish()
            .map_err(|e| CacheError::Encode(e.to_string()))?;

        if compressed.len() < raw.len() {
            Ok(Encoded {
                bytes: compressed,
                compressed: true,
            })
        } else {
            Ok(Encoded {
                bytes: raw.to_vec(),
                compressed: false,
            })
        }
    }

    pub fn decode(stored: &[u8], compressed: bool) -> Result<Vec<u8>, CacheError> {
        if !compressed {
            return Ok(stored.to_vec());
        }

        let mut decoder = DeflateDecoder::new(stored);
        let mut out = Vec::with_capacity(stored.len() * 2);
        decoder
            .read_to_end(&mut out)
            .map_err(|e| CacheError::Decode(e.to_string()))?;
        Ok(out)
    }
}
