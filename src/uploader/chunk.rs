// 流式分块读取
//
// 大文件不整体载入内存：按固定块大小增量读取，每块读取后回调进度
//
// - process：读取并重组为完整字节（小负载 / 需要完整内容时使用）
// - for_each_chunk：逐块回调（哈希计算等只需遍历一次的场景）
// - upload_stream：累积到阈值后写入 sink（上传大文件，避免内存中同时存在两份）

use async_trait::async_trait;
use futures::Stream;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 默认块大小: 1MB
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// 默认刷写阈值: 4MB
pub const DEFAULT_FLUSH_THRESHOLD: usize = 4 * 1024 * 1024;

/// 最小块大小: 4KB
pub const MIN_CHUNK_SIZE: usize = 4 * 1024;

/// 流读取错误
///
/// 已经写入 sink 的块不会由本组件重试，由调用方决定如何处理
#[derive(Debug, thiserror::Error)]
pub enum StreamReadError {
    #[error("读取负载失败 (已处理 {processed} 字节): {source}")]
    Io {
        processed: u64,
        #[source]
        source: std::io::Error,
    },
    #[error("写入接收端失败 (已处理 {processed} 字节): {source}")]
    Sink {
        processed: u64,
        #[source]
        source: std::io::Error,
    },
    #[error("流式读取已取消 (已处理 {processed} 字节)")]
    Cancelled { processed: u64 },
}

impl StreamReadError {
    /// 失败前已处理的字节数
    pub fn processed(&self) -> u64 {
        match self {
            StreamReadError::Io { processed, .. }
            | StreamReadError::Sink { processed, .. }
            | StreamReadError::Cancelled { processed } => *processed,
        }
    }
}

/// 块数据接收端
#[async_trait]
pub trait ChunkSink: Send {
    async fn write_chunk(&mut self, chunk: Vec<u8>) -> std::io::Result<()>;
}

/// 把块写入 mpsc 通道（通道另一端作为 HTTP 请求体）
pub struct ChannelSink {
    tx: mpsc::Sender<std::io::Result<Vec<u8>>>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<std::io::Result<Vec<u8>>>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl ChunkSink for ChannelSink {
    async fn write_chunk(&mut self, chunk: Vec<u8>) -> std::io::Result<()> {
        self.tx.send(Ok(chunk)).await.map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "请求体接收端已关闭")
        })
    }
}

/// 流式写入结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSummary {
    /// 读取的总字节数
    pub bytes_read: u64,
    /// 读取的块数
    pub chunks: usize,
    /// 向 sink 刷写的次数
    pub flushes: usize,
}

/// 流式分块读取器
#[derive(Debug, Clone, Copy)]
pub struct StreamChunker {
    chunk_size: usize,
    flush_threshold: usize,
}

impl Default for StreamChunker {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl StreamChunker {
    /// 创建分块读取器（块大小不小于 4KB）
    pub fn new(chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(MIN_CHUNK_SIZE);
        Self {
            chunk_size,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD.max(chunk_size),
        }
    }

    /// 指定刷写阈值（不小于块大小）
    pub fn with_flush_threshold(mut self, flush_threshold: usize) -> Self {
        self.flush_threshold = flush_threshold.max(self.chunk_size);
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn flush_threshold(&self) -> usize {
        self.flush_threshold
    }

    /// 读取全部内容并重组
    ///
    /// 每读完一块调用一次 `progress(processed, total)`
    pub async fn process<R, P>(
        &self,
        reader: &mut R,
        total: u64,
        cancel: &CancellationToken,
        progress: P,
    ) -> Result<Vec<u8>, StreamReadError>
    where
        R: AsyncRead + Unpin,
        P: FnMut(u64, u64),
    {
        let mut output = Vec::with_capacity(total.min(usize::MAX as u64) as usize);
        self.for_each_chunk(reader, total, cancel, progress, |chunk| {
            output.extend_from_slice(chunk)
        })
            .await?;
        Ok(output)
    }

    /// 逐块遍历
    ///
    /// # 返回
    /// 读取的总字节数
    pub async fn for_each_chunk<R, P, F>(
        &self,
        reader: &mut R,
        total: u64,
        cancel: &CancellationToken,
        mut progress: P,
        mut on_chunk: F,
    ) -> Result<u64, StreamReadError>
    where
        R: AsyncRead + Unpin,
        P: FnMut(u64, u64),
        F: FnMut(&[u8]),
    {
        let mut buffer = vec![0u8; self.chunk_size];
        let mut processed = 0u64;

        loop {
            if cancel.is_cancelled() {
                return Err(StreamReadError::Cancelled { processed });
            }

            let read = fill_chunk(reader, &mut buffer)
                .await
                .map_err(|source| StreamReadError::Io { processed, source })?;
            if read == 0 {
                break;
            }

            on_chunk(&buffer[..read]);
            processed += read as u64;
            progress(processed, total.max(processed));

            if read < buffer.len() {
                break;
            }
        }

        Ok(processed)
    }

    /// 流式上传：累积块直到达到刷写阈值，再写入 sink
    ///
    /// 读取失败时中止；已写入 sink 的数据不回滚
    pub async fn upload_stream<R, S, P>(
        &self,
        reader: &mut R,
        total: u64,
        sink: &mut S,
        cancel: &CancellationToken,
        mut progress: P,
    ) -> Result<StreamSummary, StreamReadError>
    where
        R: AsyncRead + Unpin,
        S: ChunkSink + ?Sized,
        P: FnMut(u64, u64),
    {
        let mut buffer = vec![0u8; self.chunk_size];
        let mut pending: Vec<u8> = Vec::with_capacity(self.flush_threshold);
        let mut summary = StreamSummary {
            bytes_read: 0,
            chunks: 0,
            flushes: 0,
        };

        loop {
            if cancel.is_cancelled() {
                return Err(StreamReadError::Cancelled {
                    processed: summary.bytes_read,
                });
            }

            let read = fill_chunk(reader, &mut buffer)
                .await
                .map_err(|source| StreamReadError::Io {
                    processed: summary.bytes_read,
                    source,
                })?;
            if read == 0 {
                break;
            }

            pending.extend_from_slice(&buffer[..read]);
            summary.bytes_read += read as u64;
            summary.chunks += 1;
            progress(summary.bytes_read, total.max(summary.bytes_read));

            if pending.len() >= self.flush_threshold {
                let data = std::mem::replace(&mut pending, Vec::with_capacity(self.flush_threshold));
                sink.write_chunk(data)
                    .await
                    .map_err(|source| StreamReadError::Sink {
                        processed: summary.bytes_read,
                        source,
                    })?;
                summary.flushes += 1;
            }

            if read < buffer.len() {
                break;
            }
        }

        if !pending.is_empty() {
            sink.write_chunk(pending)
                .await
                .map_err(|source| StreamReadError::Sink {
                    processed: summary.bytes_read,
                    source,
                })?;
            summary.flushes += 1;
        }

        debug!(
            "流式读取完成: {} 字节, {} 块, {} 次刷写",
            summary.bytes_read, summary.chunks, summary.flushes
        );

        Ok(summary)
    }

    /// 把本地文件转为块流（用作 HTTP 请求体）
    ///
    /// 后台任务负责读取，读取错误以 `Err` 形式送入流中，使请求失败
    pub fn file_stream(
        &self,
        path: PathBuf,
        size: u64,
        cancel: CancellationToken,
    ) -> ChunkStream {
        let (tx, rx) = mpsc::channel::<std::io::Result<Vec<u8>>>(2);
        let chunker = *self;

        tokio::spawn(async move {
            let error_tx = tx.clone();
            let mut sink = ChannelSink::new(tx);

            let result = match tokio::fs::File::open(&path).await {
                Ok(mut file) => chunker
                    .upload_stream(&mut file, size, &mut sink, &cancel, |_, _| {})
                    .await
                    .map(|_| ()),
                Err(source) => Err(StreamReadError::Io {
                    processed: 0,
                    source,
                }),
            };

            if let Err(e) = result {
                warn!("文件流读取中止: {:?}, 错误: {}", path, e);
                let _ = error_tx
                    .send(Err(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        e.to_string(),
                    )))
                    .await;
            }
        });

        ChunkStream { rx }
    }
}

/// 后台读取任务产出的块流
pub struct ChunkStream {
    rx: mpsc::Receiver<std::io::Result<Vec<u8>>>,
}

impl Stream for ChunkStream {
    type Item = std::io::Result<Vec<u8>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// 尽量填满一块（read 可能返回不足一块的数据）
async fn fill_chunk<R: AsyncRead + Unpin>(
    reader: &mut R,
    buffer: &mut [u8],
) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let read = reader.read(&mut buffer[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}
