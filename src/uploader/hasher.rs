// 内容哈希
//
// 去重原理：
// 1. 对负载的全部字节计算 SHA-256
// 2. 以十六进制摘要作为缓存 key
// 3. 字节相同的负载无论名称、来源如何都落到同一条缓存

use crate::uploader::chunk::{StreamChunker, StreamReadError};
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 内容哈希计算器
pub struct ContentHasher;

impl ContentHasher {
    /// 计算内存负载的哈希
    pub fn hash_bytes(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// 在阻塞线程池中计算哈希（大负载避免占用异步工作线程）
    pub async fn hash_bytes_offloaded(bytes: std::sync::Arc<Vec<u8>>) -> String {
        match tokio::task::spawn_blocking({
            let bytes = bytes.clone();
            move || Self::hash_bytes(&bytes)
        })
        .await
        {
            Ok(hash) => hash,
            // 阻塞任务被取消时退回当前线程计算
            Err(_) => Self::hash_bytes(&bytes),
        }
    }

    /// 流式计算文件哈希，不把整个文件读入内存
    pub async fn hash_file(
        path: &Path,
        chunker: &StreamChunker,
        cancel: &CancellationToken,
    ) -> Result<(String, u64), StreamReadError> {
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|source| StreamReadError::Io {
                processed: 0,
                source,
            })?;
        let total = file
            .metadata()
            .await
            .map(|m| m.len())
            .map_err(|source| StreamReadError::Io {
                processed: 0,
                source,
            })?;

        let mut hasher = Sha256::new();
        let size = chunker
            .for_each_chunk(&mut file, total, cancel, |_, _| {}, |chunk| {
                hasher.update(chunk)
            })
            .await?;

        let hash = hex::encode(hasher.finalize());
        debug!("文件哈希计算完成: {:?}, size={}, sha256={}", path, size, hash);
        Ok((hash, size))
    }
}
