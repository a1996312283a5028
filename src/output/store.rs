// 该文件是 Guzhe （骨折识别） 项目的一部分。
// src/output/store.rs - 标注图像保存
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

use std::path::{Path, PathBuf};

use image::RgbImage;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

pub const DEFAULT_UPLOAD_DIR: &str = "uploads";

#[derive(Error, Debug)]
pub enum StoreError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
}

/// 只追加的上传目录，文件名使用 UUID v4 保证并发请求之间不冲突
#[derive(Debug, Clone)]
pub struct UploadStore {
  directory: PathBuf,
}

impl Default for UploadStore {
  fn default() -> Self {
    Self::new(DEFAULT_UPLOAD_DIR)
  }
}

impl UploadStore {
  pub fn new(directory: impl Into<PathBuf>) -> Self {
    Self {
      directory: directory.into(),
    }
  }

  pub fn directory(&self) -> &Path {
    &self.directory
  }

  pub fn annotated_path(&self) -> PathBuf {
    self
      .directory
      .join(format!("annotated_{}.jpg", Uuid::new_v4()))
  }

  /// 以 JPEG 保存，返回文件路径；目录不存在时自动创建
  pub fn save(&self, image: &RgbImage) -> Result<PathBuf, StoreError> {
    if !self.directory.as_os_str().is_empty() {
      std::fs::create_dir_all(&self.directory)?;
    }

    let path = self.annotated_path();
    image.save(&path)?;
    info!("保存标注图像到文件: {}", path.display());

    Ok(path)
  }
}
