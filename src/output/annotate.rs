// 该文件是 Guzhe （骨折识别） 项目的一部分。
// src/output/annotate.rs - 显著区域标注
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

use image::{GrayImage, ImageBuffer, Luma, Rgb, RgbImage, imageops::FilterType};
use imageproc::{
  contours::{BorderType, Contour, find_contours},
  drawing::draw_hollow_rect_mut,
  rect::Rect,
};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::explain::Heatmap;

const REGION_THRESHOLD: u8 = 127;
const REGION_COLOR: [u8; 3] = [0, 255, 0]; // 绿色
const REGION_THICKNESS: u32 = 2;

#[derive(Error, Debug)]
pub enum AnnotationError {
  #[error("热力图为空")]
  EmptyHeatmap,
  #[error("热力图数据无效: {0}x{1}")]
  InvalidHeatmap(usize, usize),
  #[error("图像尺寸为零")]
  EmptyImage,
}

/// 轴对齐外接矩形，坐标为原图像素，边界包含在内
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BoundingBox {
  pub x: u32,
  pub y: u32,
  pub width: u32,
  pub height: u32,
}

#[derive(Debug, Clone)]
pub struct Annotation {
  pub image: RgbImage,
  pub region: Option<BoundingBox>,
}

pub struct RegionAnnotator {
  threshold: u8,
  color: [u8; 3],
  thickness: u32,
}

impl Default for RegionAnnotator {
  fn default() -> Self {
    Self {
      threshold: REGION_THRESHOLD,
      color: REGION_COLOR,
      thickness: REGION_THICKNESS,
    }
  }
}

impl RegionAnnotator {
  pub fn color(&self) -> Rgb<u8> {
    Rgb(self.color)
  }

  /// 在彩色图像副本上框出热力图中面积最大的高响应区域；没有高响应区域时返回原图副本
  pub fn annotate(&self, image: &RgbImage, heatmap: &Heatmap) -> Result<Annotation, AnnotationError> {
    let region = self.salient_region(heatmap, image.dimensions())?;
    let mut annotated = image.clone();
    if let Some(region) = region {
      debug!("显著区域: {:?}", region);
      self.draw_region(&mut annotated, &region);
    } else {
      debug!("热力图中没有高于阈值的区域");
    }

    Ok(Annotation {
      image: annotated,
      region,
    })
  }

  pub fn salient_region(
    &self,
    heatmap: &Heatmap,
    (width, height): (u32, u32),
  ) -> Result<Option<BoundingBox>, AnnotationError> {
    if width == 0 || height == 0 {
      return Err(AnnotationError::EmptyImage);
    }
    let mask = self.mask(heatmap, (width, height))?;

    let contours: Vec<Contour<i32>> = find_contours(&mask);
    let largest = contours
      .iter()
      .filter(|c| c.border_type == BorderType::Outer && !c.points.is_empty())
      .fold(None::<(&Contour<i32>, f64)>, |best, contour| {
        let area = polygon_area(contour);
        match best {
          Some((_, max)) if area <= max => best,
          _ => Some((contour, area)),
        }
      });

    Ok(largest.map(|(contour, area)| {
      debug!("最大轮廓面积: {:.1}, 点数: {}", area, contour.points.len());
      bounding_box(contour)
    }))
  }

  /// 上采样到原图尺寸，缩放到 0..=255 后按阈值二值化
  pub fn mask(&self, heatmap: &Heatmap, (width, height): (u32, u32)) -> Result<GrayImage, AnnotationError> {
    let (rows, cols) = heatmap.dim();
    if rows == 0 || cols == 0 {
      return Err(AnnotationError::EmptyHeatmap);
    }

    let raw: Vec<f32> = heatmap.data().iter().copied().collect();
    let small: ImageBuffer<Luma<f32>, Vec<f32>> =
      ImageBuffer::from_raw(cols as u32, rows as u32, raw)
        .ok_or(AnnotationError::InvalidHeatmap(rows, cols))?;
    let upsampled = image::imageops::resize(&small, width, height, FilterType::Triangle);

    Ok(GrayImage::from_fn(width, height, |x, y| {
      let Luma([value]) = *upsampled.get_pixel(x, y);
      Luma([binarize(value, self.threshold)])
    }))
  }

  fn draw_region(&self, image: &mut RgbImage, region: &BoundingBox) {
    for t in 0..self.thickness {
      let width = region.width.saturating_sub(2 * t);
      let height = region.height.saturating_sub(2 * t);
      if width == 0 || height == 0 {
        break;
      }
      let rect = Rect::at((region.x + t) as i32, (region.y + t) as i32).of_size(width, height);
      draw_hollow_rect_mut(image, rect, Rgb(self.color));
    }
  }
}

/// 截断到 8 位后大于阈值的像素置 255，否则置 0
fn binarize(value: f32, threshold: u8) -> u8 {
  let scaled = (value * 255.0) as u8;
  if scaled > threshold { 255 } else { 0 }
}

/// 鞋带公式求轮廓多边形面积
fn polygon_area(contour: &Contour<i32>) -> f64 {
  let points = &contour.points;
  let n = points.len();
  let twice: i64 = (0..n)
    .map(|i| {
      let (a, b) = (points[i], points[(i + 1) % n]);
      a.x as i64 * b.y as i64 - b.x as i64 * a.y as i64
    })
    .sum();
  (twice as f64 / 2.0).abs()
}

fn bounding_box(contour: &Contour<i32>) -> BoundingBox {
  let (mut min_x, mut min_y) = (i32::MAX, i32::MAX);
  let (mut max_x, mut max_y) = (i32::MIN, i32::MIN);
  for p in &contour.points {
    min_x = min_x.min(p.x);
    min_y = min_y.min(p.y);
    max_x = max_x.max(p.x);
    max_y = max_y.max(p.y);
  }
  BoundingBox {
    x: min_x.max(0) as u32,
    y: min_y.max(0) as u32,
    width: (max_x - min_x + 1) as u32,
    height: (max_y - min_y + 1) as u32,
  }
}
