// 该文件是 Guzhe （骨折识别） 项目的一部分。
// src/explain.rs - Grad-CAM 显著性热力图
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

use ndarray::{Array2, Array3, Axis, s};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
  frame::InputTensor,
  model::{ClassTarget, Classifier, ClassifierError},
};

/// 归一化时防止除零
pub const HEATMAP_EPSILON: f32 = 1e-8;

#[derive(Error, Debug)]
pub enum SaliencyError {
  #[error("模型中找不到可用的卷积层")]
  NoConvLayerFound,
  #[error("找不到目标层 {0}, 或其输出不是特征图")]
  TargetLayerInvalid(String),
  #[error("无法获得梯度: {0}")]
  GradientUnavailable(String),
  #[error("分类器错误: {0}")]
  Classifier(#[from] ClassifierError),
}

/// 最后卷积层分辨率上的热力图，取值范围 `[0, 1]`
#[derive(Debug, Clone, PartialEq)]
pub struct Heatmap {
  data: Array2<f32>,
  class_index: usize,
}

impl Heatmap {
  pub fn new(data: Array2<f32>, class_index: usize) -> Self {
    Self { data, class_index }
  }

  pub fn data(&self) -> &Array2<f32> {
    &self.data
  }

  /// `(height, width)`
  pub fn dim(&self) -> (usize, usize) {
    self.data.dim()
  }

  /// 热力图所解释的类别
  pub fn class_index(&self) -> usize {
    self.class_index
  }
}

/// 对分类器当前预测的类别计算 Grad-CAM 热力图。
///
/// 目标层缺省为按深度顺序的最后一个卷积层。
pub fn compute_heatmap<C: Classifier + ?Sized>(
  input: &InputTensor,
  classifier: &C,
  target_layer: Option<&str>,
) -> Result<Heatmap, SaliencyError> {
  let layer = match target_layer {
    Some(name) => name,
    None => classifier.last_conv_layer().ok_or_else(|| {
      warn!("模型中没有卷积层，无法计算 Grad-CAM");
      SaliencyError::NoConvLayerFound
    })?,
  };
  debug!("Grad-CAM 目标层: {}", layer);

  let gradient = classifier
    .layer_gradient(input, layer, ClassTarget::Predicted)
    .map_err(|e| match e {
      ClassifierError::LayerNotFound(name) | ClassifierError::NotSpatial(name) => {
        SaliencyError::TargetLayerInvalid(name)
      }
      other => SaliencyError::Classifier(other),
    })?;

  let data = grad_cam(&gradient.activations, &gradient.gradients)?;
  debug!(
    "Grad-CAM 完成: 类别 {}, 热力图 {:?}",
    gradient.class_index,
    data.dim()
  );
  Ok(Heatmap::new(data, gradient.class_index))
}

/// 通道权重取梯度的空间均值，对激活加权求和，ReLU 后按最大值归一化
pub fn grad_cam(activations: &Array3<f32>, gradients: &Array3<f32>) -> Result<Array2<f32>, SaliencyError> {
  if activations.dim() != gradients.dim() {
    return Err(SaliencyError::GradientUnavailable(format!(
      "激活形状 {:?} 与梯度形状 {:?} 不一致",
      activations.dim(),
      gradients.dim()
    )));
  }
  if !gradients.iter().all(|v| v.is_finite()) {
    return Err(SaliencyError::GradientUnavailable(
      "梯度中出现非有限值".to_string(),
    ));
  }

  let (h, w, _) = activations.dim();
  let weights = gradients
    .mean_axis(Axis(0))
    .and_then(|g| g.mean_axis(Axis(0)))
    .ok_or_else(|| SaliencyError::GradientUnavailable("特征图为空".to_string()))?;

  let mut heatmap = Array2::from_shape_fn((h, w), |(y, x)| {
    activations.slice(s![y, x, ..]).dot(&weights)
  });
  heatmap.mapv_inplace(|v| if v > 0.0 { v } else { 0.0 });

  let max = heatmap.iter().copied().fold(0.0f32, f32::max);
  heatmap.mapv_inplace(|v| v / (max + HEATMAP_EPSILON));
  Ok(heatmap)
}
