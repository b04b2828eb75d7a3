// 带回退链的优化门面
//
// 按顺序尝试一组可互换的策略：
// 1. 跳过当前机器不支持的策略
// 2. 失败只降级到下一个策略，不中断操作
// 3. 记录每个策略的成功/失败次数
// 4. 所有策略都失败时返回错误，不会静默吞掉
//
// 重新编码保持原格式（PNG/JPEG），其余格式交给下一个策略

use crate::device::capability::{Capabilities, Feature};
use crate::device::profile::{CompressionLevel, Settings};
use crate::error::PublishError;
use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::imageops::FilterType;
use image::{ColorType, DynamicImage, GenericImageView, ImageEncoder, ImageFormat};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

/// 默认最大边长
const DEFAULT_MAX_DIMENSION: u32 = 2048;

/// 优化参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimizeOptions {
    pub max_dimension: u32,
    /// 0.0-1.0
    pub quality: f32,
    pub compression: CompressionLevel,
}

impl Default for OptimizeOptions {
    fn default() -> Self {
        Self {
            max_dimension: DEFAULT_MAX_DIMENSION,
            quality: 0.85,
            compression: CompressionLevel::Medium,
        }
    }
}

/// 高压缩等级下 JPEG 质量上限
const HIGH_COMPRESSION_JPEG_CAP: f32 = 0.7;

impl OptimizeOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            quality: settings.image_quality,
            compression: settings.compression_level,
            ..Default::default()
        }
    }

    fn jpeg_quality(&self) -> u8 {
        let quality = match self.compression {
            CompressionLevel::High => self.quality.min(HIGH_COMPRESSION_JPEG_CAP),
            _ => self.quality,
        };
        (quality.clamp(0.05, 1.0) * 100.0).round() as u8
    }

    fn png_params(&self) -> (CompressionType, PngFilter) {
        match self.compression {
            CompressionLevel::Low => (CompressionType::Fast, PngFilter::NoFilter),
            CompressionLevel::Medium => (CompressionType::Default, PngFilter::Adaptive),
            CompressionLevel::High => (CompressionType::Best, PngFilter::Adaptive),
        }
    }
}

/// 优化策略
pub trait OptimizeStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_supported(&self, capabilities: &Capabilities) -> bool;

    fn optimize(&self, input: &[u8], options: &OptimizeOptions) -> Result<Vec<u8>>;
}

/// 按原格式编码
fn encode_as(image: &DynamicImage, format: ImageFormat, options: &OptimizeOptions) -> Result<Vec<u8>> {
    let (width, height) = image.dimensions();
    let mut out = Vec::new();
    match format {
        ImageFormat::Jpeg => {
            let rgb = image.to_rgb8();
            JpegEncoder::new_with_quality(&mut out, options.jpeg_quality())
                .encode(rgb.as_raw(), width, height, ColorType::Rgb8)
                .context("JPEG 编码失败")?;
        }
        ImageFormat::Png => {
            // 保留原有通道（包括透明度）
            let color = image.color();
            if !matches!(
                color,
                ColorType::L8 | ColorType::La8 | ColorType::Rgb8 | ColorType::Rgba8
            ) {
                anyhow::bail!("不支持的 PNG 色彩类型: {:?}", color);
            }
            let (compression, filter) = options.png_params();
            PngEncoder::new_with_quality(&mut out, compression, filter)
                .write_image(image.as_bytes(), width, height, color)
                .context("PNG 编码失败")?;
        }
        other => anyhow::bail!("不支持按原格式重新编码: {:?}", other),
    }
    Ok(out)
}

/// 缩放后按原格式重新编码；未缩放且没有变小时保留原始字节
///
/// 只处理 PNG 与 JPEG；GIF 动画、WebP 等格式返回错误，由调用方降级
fn reencode<F>(input: &[u8], options: &OptimizeOptions, shrink: F) -> Result<Vec<u8>>
where
    F: Fn(&DynamicImage, u32) -> DynamicImage,
{
    let format = image::guess_format(input).context("无法识别图片格式")?;
    if !matches!(format, ImageFormat::Png | ImageFormat::Jpeg) {
        anyhow::bail!("不支持按原格式重新编码: {:?}", format);
    }
    let image = image::load_from_memory_with_format(input, format).context("无法解码图片")?;
    let (width, height) = image.dimensions();
    let resized = width > options.max_dimension || height > options.max_dimension;

    let image = if resized {
        shrink(&image, options.max_dimension)
    } else {
        image
    };

    let encoded = encode_as(&image, format, options)?;
    if !resized && encoded.len() >= input.len() {
        return Ok(input.to_vec());
    }
    Ok(encoded)
}

/// 快速整数缩略路径（依赖 SIMD）
pub struct ThumbnailStrategy;

impl OptimizeStrategy for ThumbnailStrategy {
    fn name(&self) -> &'static str {
        "thumbnail"
    }

    fn is_supported(&self, capabilities: &Capabilities) -> bool {
        capabilities.has(Feature::Simd)
    }

    fn optimize(&self, input: &[u8], options: &OptimizeOptions) -> Result<Vec<u8>> {
        reencode(input, options, |image, max| image.thumbnail(max, max))
    }
}

/// 通用滤波重采样
pub struct ResampleStrategy;

impl OptimizeStrategy for ResampleStrategy {
    fn name(&self) -> &'static str {
        "resample"
    }

    fn is_supported(&self, _capabilities: &Capabilities) -> bool {
        true
    }

    fn optimize(&self, input: &[u8], options: &OptimizeOptions) -> Result<Vec<u8>> {
        reencode(input, options, |image, max| {
            image.resize(max, max, FilterType::Triangle)
        })
    }
}

/// 原样返回
pub struct PassthroughStrategy;

impl OptimizeStrategy for PassthroughStrategy {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn is_supported(&self, _capabilities: &Capabilities) -> bool {
        true
    }

    fn optimize(&self, input: &[u8], _options: &OptimizeOptions) -> Result<Vec<u8>> {
        Ok(input.to_vec())
    }
}

/// 单个策略的计数
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyStats {
    pub name: String,
    pub successes: u64,
    pub failures: u64,
}

/// 优化结果
#[derive(Debug, Clone)]
pub struct Optimized {
    pub bytes: Vec<u8>,
    pub strategy: &'static str,
}

/// 安全优化器
pub struct SafeOptimizer {
    strategies: Vec<Box<dyn OptimizeStrategy>>,
    capabilities: Capabilities,
    counters: Mutex<HashMap<&'static str, (u64, u64)>>,
}

impl SafeOptimizer {
    pub fn new(strategies: Vec<Box<dyn OptimizeStrategy>>, capabilities: Capabilities) -> Self {
        Self {
            strategies,
            capabilities,
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// 图片优化链：thumbnail → resample → passthrough
    pub fn for_images(capabilities: Capabilities) -> Self {
        Self::new(
            vec![
                Box::new(ThumbnailStrategy),
                Box::new(ResampleStrategy),
                Box::new(PassthroughStrategy),
            ],
            capabilities,
        )
    }

    pub fn optimize(
        &self,
        input: &[u8],
        options: &OptimizeOptions,
    ) -> Result<Optimized, PublishError> {
        let mut reasons = Vec::new();

        for strategy in &self.strategies {
            if !strategy.is_supported(&self.capabilities) {
                debug!("跳过不支持的优化策略: {}", strategy.name());
                continue;
            }

            match strategy.optimize(input, options) {
                Ok(bytes) => {
                    self.counters.lock().entry(strategy.name()).or_default().0 += 1;
                    debug!(
                        "优化成功: strategy={}, {} -> {} 字节",
                        strategy.name(),
                        input.len(),
                        bytes.len()
                    );
                    return Ok(Optimized {
                        bytes,
                        strategy: strategy.name(),
                    });
                }
                Err(e) => {
                    self.counters.lock().entry(strategy.name()).or_default().1 += 1;
                    debug!("优化策略 {} 失败，降级: {:#}", strategy.name(), e);
                    reasons.push(format!("{}: {:#}", strategy.name(), e));
                }
            }
        }

        warn!("所有优化策略均失败: {:?}", reasons);
        Err(PublishError::Optimize(if reasons.is_empty() {
            "没有可用的优化策略".to_string()
        } else {
            reasons.join("; ")
        }))
    }

    /// 按策略顺序返回计数
    pub fn stats(&self) -> Vec<StrategyStats> {
        let counters = self.counters.lock();
        self.strategies
            .iter()
            .map(|strategy| {
                let (successes, failures) =
                    counters.get(strategy.name()).copied().unwrap_or_default();
                StrategyStats {
                    name: strategy.name().to_string(),
                    successes,
                    failures,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageOutputFormat, RgbImage, RgbaImage};
    use std::io::Cursor;

    const PNG_MAGIC: [u8; 4] = [0x89, 0x50, 0x4e, 0x47];
    const JPEG_MAGIC: [u8; 3] = [0xff, 0xd8, 0xff];

    fn gradient(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        }))
    }

    fn encode(image: &DynamicImage, format: ImageOutputFormat) -> Vec<u8> {
        let mut out = Vec::new();
        image.write_to(&mut Cursor::new(&mut out), format).unwrap();
        out
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        encode(&gradient(width, height), ImageOutputFormat::Png)
    }

    fn small_options() -> OptimizeOptions {
        OptimizeOptions {
            max_dimension: 32,
            quality: 0.8,
            compression: CompressionLevel::Medium,
        }
    }

    #[test]
    fn test_simd_machine_uses_thumbnail() {
        let optimizer = SafeOptimizer::for_images(Capabilities::with_features([Feature::Simd]));
        let result = optimizer.optimize(&png(128, 64), &small_options()).unwrap();
        assert_eq!(result.strategy, "thumbnail");

        let decoded = image::load_from_memory(&result.bytes).unwrap();
        assert!(decoded.width() <= 32 && decoded.height() <= 32);
    }

    #[test]
    fn test_without_simd_falls_back_to_resample() {
        let optimizer = SafeOptimizer::for_images(Capabilities::default());
        let result = optimizer.optimize(&png(128, 64), &small_options()).unwrap();
        assert_eq!(result.strategy, "resample");

        let stats = optimizer.stats();
        assert_eq!(stats[0].successes + stats[0].failures, 0);
        assert_eq!(stats[1].successes, 1);
    }

    #[test]
    fn test_non_image_degrades_to_passthrough() {
        let optimizer = SafeOptimizer::for_images(Capabilities::with_features([Feature::Simd]));
        let input = b"{\"name\":\"metadata only\"}".to_vec();
        let result = optimizer.optimize(&input, &small_options()).unwrap();

        assert_eq!(result.strategy, "passthrough");
        assert_eq!(result.bytes, input);

        let stats = optimizer.stats();
        assert_eq!(stats[0].failures, 1);
        assert_eq!(stats[1].failures, 1);
        assert_eq!(stats[2].successes, 1);
    }

    #[test]
    fn test_total_failure_is_reported() {
        let optimizer = SafeOptimizer::new(
            vec![Box::new(ResampleStrategy)],
            Capabilities::default(),
        );
        let err = optimizer.optimize(b"garbage", &small_options()).unwrap_err();
        assert!(matches!(err, PublishError::Optimize(reason) if reason.contains("resample")));
    }

    #[test]
    fn test_png_stays_png() {
        let optimizer = SafeOptimizer::for_images(Capabilities::default());
        let result = optimizer.optimize(&png(2100, 16), &OptimizeOptions::default()).unwrap();

        assert_eq!(result.strategy, "resample");
        assert_eq!(result.bytes[..4], PNG_MAGIC);
        let decoded = image::load_from_memory(&result.bytes).unwrap();
        assert!(decoded.width() <= DEFAULT_MAX_DIMENSION);
    }

    #[test]
    fn test_png_keeps_transparency() {
        let image = DynamicImage::ImageRgba8(RgbaImage::from_fn(128, 64, |x, y| {
            image::Rgba([x as u8, y as u8, 0, (x % 2 * 255) as u8])
        }));
        let input = encode(&image, ImageOutputFormat::Png);

        let optimizer = SafeOptimizer::for_images(Capabilities::default());
        let result = optimizer.optimize(&input, &small_options()).unwrap();
        let decoded = image::load_from_memory(&result.bytes).unwrap();
        assert_eq!(decoded.color(), ColorType::Rgba8);
    }

    #[test]
    fn test_jpeg_stays_jpeg() {
        let input = encode(&gradient(128, 64), ImageOutputFormat::Jpeg(90));
        let optimizer = SafeOptimizer::for_images(Capabilities::default());
        let result = optimizer.optimize(&input, &small_options()).unwrap();

        assert_eq!(result.strategy, "resample");
        assert_eq!(result.bytes[..3], JPEG_MAGIC);
    }

    #[test]
    fn test_gif_is_passed_through_unchanged() {
        let input = encode(&gradient(128, 64), ImageOutputFormat::Gif);
        let optimizer = SafeOptimizer::for_images(Capabilities::with_features([Feature::Simd]));
        let result = optimizer.optimize(&input, &small_options()).unwrap();

        assert_eq!(result.strategy, "passthrough");
        assert_eq!(result.bytes, input);
    }

    #[test]
    fn test_high_compression_shrinks_png_further() {
        let input = png(256, 256);
        let optimizer = SafeOptimizer::for_images(Capabilities::default());
        let run = |compression| {
            let options = OptimizeOptions {
                max_dimension: 128,
                quality: 0.8,
                compression,
            };
            optimizer.optimize(&input, &options).unwrap().bytes
        };

        let low = run(CompressionLevel::Low);
        let high = run(CompressionLevel::High);
        assert_eq!(high[..4], PNG_MAGIC);
        assert!(high.len() < low.len());
    }

    #[test]
    fn test_quality_mapping() {
        let options = OptimizeOptions {
            max_dimension: 10,
            quality: 0.6,
            compression: CompressionLevel::Medium,
        };
        assert_eq!(options.jpeg_quality(), 60);

        let options = OptimizeOptions {
            quality: 0.9,
            compression: CompressionLevel::High,
            ..options
        };
        assert_eq!(options.jpeg_quality(), 70);
    }

    #[test]
    fn test_settings_carry_compression_level() {
        let settings = Settings {
            compression_level: CompressionLevel::High,
            image_quality: 0.6,
            ..Default::default()
        };
        let options = OptimizeOptions::from_settings(&settings);
        assert_eq!(options.compression, CompressionLevel::High);
        assert_eq!(options.quality, 0.6);
    }
}
