// 该文件是 Guzhe （骨折识别） 项目的一部分。
// src/response.rs - 响应结构
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

use serde::{Deserialize, Serialize};

use crate::model::Prediction;

pub const NO_IMAGE_PROVIDED: &str = "No image file provided";
pub const PREPROCESS_FAILED: &str = "Failed to preprocess image";
pub const PREDICTION_FAILED: &str = "Prediction failed";

/// 成功的预测结果；没有标注图像时 `annotatedImagePath` 为 `null`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResponse {
  pub prediction: String,
  pub confidence: f32,
  #[serde(rename = "annotatedImagePath")]
  pub annotated_image_path: Option<String>,
}

impl PredictionResponse {
  pub fn new(prediction: Prediction, annotated: Option<&Path>) -> Self {
    Self {
      prediction: prediction.label,
      confidence: prediction.confidence,
      // 统一使用 `/` 分隔，便于直接拼接到 URL
      annotated_image_path: annotated.map(|path| path.to_string_lossy().replace('\\', "/")),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
  pub error: String,
}

impl ErrorResponse {
  pub fn new(error: impl Into<String>) -> Self {
    Self {
      error: error.into(),
    }
  }
}
