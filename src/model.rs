// 该文件是 Guzhe （骨折识别） 项目的一部分。
// src/model.rs - 分类模型
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
use thiserror::Error;

use crate::frame::InputTensor;

mod labels;
mod layer;
pub mod select;
mod sequential;

pub use self::labels::{LabelError, LabelTable};
pub use self::layer::{
  Activation, Conv2d, Dense, Layer, LayerError, LayerKind, MaxPool2d, Padding, Shape, Tensor,
};
pub use self::select::{Prediction, SelectError, arg_max, select};
pub use self::sequential::{Manifest, ModelError, Sequential, SequentialBuilder};

/// 每个类别一个分数，与 [`LabelTable`] 按下标对应
#[derive(Debug, Clone, PartialEq)]
pub struct ClassScores(Box<[f32]>);

impl From<Vec<f32>> for ClassScores {
  fn from(scores: Vec<f32>) -> Self {
    Self(scores.into_boxed_slice())
  }
}

impl ClassScores {
  pub fn as_slice(&self) -> &[f32] {
    &self.0
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn arg_max(&self) -> Option<usize> {
    arg_max(&self.0)
  }
}

/// 求梯度时的目标类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassTarget {
  /// 同一次前向传播中得分最高的类别
  Predicted,
  Index(usize),
}

impl ClassTarget {
  /// 在一次前向传播的分数上确定目标类别下标
  pub fn resolve(self, scores: &[f32]) -> Result<usize, ClassifierError> {
    match self {
      ClassTarget::Predicted => arg_max(scores).ok_or(ClassifierError::EmptyOutput),
      ClassTarget::Index(index) if index < scores.len() => Ok(index),
      ClassTarget::Index(index) => Err(ClassifierError::ClassOutOfRange {
        index,
        classes: scores.len(),
      }),
    }
  }
}

/// 目标层的激活及目标类别分数对该激活的梯度，二者形状均为 `[h, w, k]`
#[derive(Debug, Clone)]
pub struct LayerGradient {
  pub activations: Array3<f32>,
  pub gradients: Array3<f32>,
  pub scores: ClassScores,
  pub class_index: usize,
}

#[derive(Error, Debug)]
pub enum ClassifierError {
  #[error("网络层错误: {0}")]
  Layer(#[from] LayerError),
  #[error("模型输入形状为 {model:?}, 与输入张量 {tensor:?} 不一致")]
  InputShape { model: [usize; 3], tensor: [usize; 3] },
  #[error("找不到网络层: {0}")]
  LayerNotFound(String),
  #[error("网络层 {0} 的输出不是空间特征图")]
  NotSpatial(String),
  #[error("模型输出不是一维分数向量")]
  OutputNotFlat,
  #[error("模型输出为空或全部为 NaN")]
  EmptyOutput,
  #[error("类别下标 {index} 超出范围 (共 {classes} 类)")]
  ClassOutOfRange { index: usize, classes: usize },
}

/// 预训练图像分类器。
///
/// 加载后只读，所有操作都通过 `&self` 完成，可以在多个请求之间共享。
pub trait Classifier: Send + Sync {
  fn labels(&self) -> &LabelTable;

  /// 单次前向传播，批大小为 1
  fn predict(&self, input: &InputTensor) -> Result<ClassScores, ClassifierError>;

  /// 按网络深度顺序最后一个卷积层的名称
  fn last_conv_layer(&self) -> Option<&str>;

  /// 一次前向传播同时得到目标层激活、输出分数，以及目标类别分数对该层输出的梯度
  fn layer_gradient(
    &self,
    input: &InputTensor,
    target_layer: &str,
    target: ClassTarget,
  ) -> Result<LayerGradient, ClassifierError>;
}
