// 该文件是 Guzhe （骨折识别） 项目的一部分。
// src/input/decode.rs - 图像解码与预处理
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::path::Path;

use image::{GrayImage, Luma, RgbImage, imageops::FilterType};
use thiserror::Error;
use tracing::{debug, error};

use crate::frame::{FrameShapeError, GrayNhwcFrame, InputTensor};

/// 缩放到分类器输入尺寸时使用的插值方式（双线性）
pub const RESIZE_FILTER: FilterType = FilterType::Triangle;

#[derive(Error, Debug)]
pub enum DecodeError {
  #[error("图像数据为空")]
  Empty,
  #[error("I/O 错误: {0}")]
  IoError(std::io::Error),
  #[error("图像解码错误: {0}")]
  ImageLoadError(image::ImageError),
  #[error("图像尺寸为零: {0}x{1}")]
  ZeroSized(u32, u32),
  #[error("张量形状错误: {0}")]
  Shape(#[from] FrameShapeError),
}

impl From<std::io::Error> for DecodeError {
  fn from(err: std::io::Error) -> Self {
    DecodeError::IoError(err)
  }
}

impl From<image::ImageError> for DecodeError {
  fn from(err: image::ImageError) -> Self {
    DecodeError::ImageLoadError(err)
  }
}

/// 同一份字节解码出的两种表示
#[derive(Debug, Clone)]
pub struct DecodedImage {
  /// 分类器输入，`[1, 150, 150, 1]`
  pub tensor: InputTensor,
  /// 原始分辨率的彩色图像，用于绘制标注
  pub color: RgbImage,
}

/// 将编码后的图像字节解码为分类器输入张量和原尺寸彩色图像。
///
/// 灰度视图按双线性插值缩放到 150x150，像素值除以 255 归一化。
pub fn decode_image(bytes: &[u8]) -> Result<DecodedImage, DecodeError> {
  if bytes.is_empty() {
    error!("图像数据为空");
    return Err(DecodeError::Empty);
  }

  let image = image::load_from_memory(bytes).inspect_err(|e| error!("图像解码失败: {}", e))?;
  let (width, height) = (image.width(), image.height());
  if width == 0 || height == 0 {
    return Err(DecodeError::ZeroSized(width, height));
  }
  debug!("图像解码完成: {}x{} {:?}", width, height, image.color());

  let color = image.to_rgb8();
  let gray = bt601_luma(&color);
  let tensor = gray_to_frame(&gray)?;

  Ok(DecodedImage { tensor, color })
}

// BT.601 定点系数，Q14
const LUMA_SHIFT: u32 = 14;
const LUMA_R: u32 = 4899;
const LUMA_G: u32 = 9617;
const LUMA_B: u32 = 1868;

/// 按 BT.601 权重 (0.299, 0.587, 0.114) 转为灰度，定点运算并四舍五入，
/// 与训练时读取灰度图的结果一致
pub fn bt601_luma(color: &RgbImage) -> GrayImage {
  GrayImage::from_fn(color.width(), color.height(), |x, y| {
    let [r, g, b] = color.get_pixel(x, y).0;
    let sum = r as u32 * LUMA_R + g as u32 * LUMA_G + b as u32 * LUMA_B;
    Luma([((sum + (1 << (LUMA_SHIFT - 1))) >> LUMA_SHIFT) as u8])
  })
}

pub fn decode_image_file<P: AsRef<Path>>(path: P) -> Result<DecodedImage, DecodeError> {
  let bytes = std::fs::read(path.as_ref())?;
  debug!(
    "读取图像文件: {} ({} 字节)",
    path.as_ref().display(),
    bytes.len()
  );
  decode_image(&bytes)
}

pub fn gray_to_frame<const W: u32, const H: u32>(
  gray: &GrayImage,
) -> Result<GrayNhwcFrame<W, H>, DecodeError> {
  let resized = image::imageops::resize(gray, W, H, RESIZE_FILTER);
  let data: Vec<f32> = resized
    .as_raw()
    .iter()
    .map(|&value| value as f32 / 255.0)
    .collect();
  Ok(GrayNhwcFrame::try_from(data)?)
}
