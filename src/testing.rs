// 该文件是 Guzhe （骨折识别） 项目的一部分。
// src/testing.rs - 单元测试用分类器
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

use ndarray::Array3;

use crate::{
  frame::InputTensor,
  model::{ClassScores, ClassTarget, Classifier, ClassifierError, LabelTable, LayerGradient},
};

pub const FIXED_CONV_LAYER: &str = "conv2d_2";

/// 输出固定分数的分类器；目标层的激活与梯度也是预设值
pub struct FixedClassifier {
  pub labels: LabelTable,
  pub scores: Vec<f32>,
  pub conv: Option<&'static str>,
  pub activations: Array3<f32>,
  pub gradients: Array3<f32>,
}

impl FixedClassifier {
  /// 默认带一个 4x4 单通道的卷积层，左上角激活、梯度处处为 1
  pub fn new<S: Into<String>>(labels: impl IntoIterator<Item = S>, scores: &[f32]) -> Self {
    Self {
      labels: LabelTable::new(labels).unwrap(),
      scores: scores.to_vec(),
      conv: Some(FIXED_CONV_LAYER),
      activations: Array3::from_shape_fn((4, 4, 1), |(y, x, _)| if y < 2 && x < 2 { 1.0 } else { 0.0 }),
      gradients: Array3::from_elem((4, 4, 1), 1.0),
    }
  }

  pub fn without_conv(mut self) -> Self {
    self.conv = None;
    self
  }

  pub fn with_layer(mut self, activations: Array3<f32>, gradients: Array3<f32>) -> Self {
    self.activations = activations;
    self.gradients = gradients;
    self
  }
}

impl Classifier for FixedClassifier {
  fn labels(&self) -> &LabelTable {
    &self.labels
  }

  fn predict(&self, _: &InputTensor) -> Result<ClassScores, ClassifierError> {
    Ok(ClassScores::from(self.scores.clone()))
  }

  fn last_conv_layer(&self) -> Option<&str> {
    self.conv
  }

  fn layer_gradient(
    &self,
    _: &InputTensor,
    target_layer: &str,
    target: ClassTarget,
  ) -> Result<LayerGradient, ClassifierError> {
    if Some(target_layer) != self.conv {
      return Err(ClassifierError::LayerNotFound(target_layer.to_string()));
    }
    let class_index = target.resolve(&self.scores)?;
    Ok(LayerGradient {
      activations: self.activations.clone(),
      gradients: self.gradients.clone(),
      scores: ClassScores::from(self.scores.clone()),
      class_index,
    })
  }
}
