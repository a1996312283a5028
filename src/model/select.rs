// 该文件是 Guzhe （骨折识别） 项目的一部分。
// src/model/select.rs - 预测结果选择
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

use serde::Serialize;
use thiserror::Error;

use crate::model::{ClassScores, LabelTable};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SelectError {
  #[error("分数数量 {scores} 与标签数量 {labels} 不一致")]
  LengthMismatch { scores: usize, labels: usize },
  #[error("没有可用的分数")]
  NoScore,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
  #[serde(rename = "prediction")]
  pub label: String,
  pub confidence: f32,
}

/// 最大值下标，并列时取最小下标，NaN 不参与比较
pub fn arg_max(scores: &[f32]) -> Option<usize> {
  let mut best: Option<(usize, f32)> = None;
  for (index, &score) in scores.iter().enumerate() {
    if score.is_nan() {
      continue;
    }
    match best {
      Some((_, max)) if score <= max => {}
      _ => best = Some((index, score)),
    }
  }
  best.map(|(index, _)| index)
}

/// `label = labels[argmax(scores)]`, `confidence = max(scores)`
pub fn select(scores: &ClassScores, labels: &LabelTable) -> Result<Prediction, SelectError> {
  let scores = scores.as_slice();
  if scores.len() != labels.len() {
    return Err(SelectError::LengthMismatch {
      scores: scores.len(),
      labels: labels.len(),
    });
  }

  let index = arg_max(scores).ok_or(SelectError::NoScore)?;
  let label = labels.get(index).ok_or(SelectError::NoScore)?;

  Ok(Prediction {
    label: label.to_string(),
    confidence: scores[index],
  })
}
