// 该文件是 Guzhe （骨折识别） 项目的一部分。
// tests/common/mod.rs - 集成测试公共工具
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

#![allow(dead_code)]

use std::{
  io::Cursor,
  path::{Path, PathBuf},
  sync::Arc,
};

use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use ndarray::Array3;
use safetensors::{Dtype, tensor::TensorView};

use guzhe::{
  frame::InputTensor,
  model::{ClassScores, ClassTarget, Classifier, ClassifierError, LabelTable, LayerGradient},
};

pub const LABELS: [&str; 3] = ["comminuted_fracture", "no_fracture", "simple_fracture"];
pub const NO_FRACTURE_SCORES: [f32; 3] = [0.02, 0.95, 0.03];

/// 返回固定分数的分类器，可选地带一个 4x4 的“卷积层”
pub struct FixedClassifier {
  labels: LabelTable,
  scores: Vec<f32>,
  conv: Option<&'static str>,
}

impl FixedClassifier {
  pub fn new(scores: &[f32], conv: Option<&'static str>) -> Self {
    Self {
      labels: LabelTable::new_sorted(LABELS).unwrap(),
      scores: scores.to_vec(),
      conv,
    }
  }

  pub fn no_fracture() -> Arc<dyn Classifier> {
    Arc::new(Self::new(&NO_FRACTURE_SCORES, Some("conv2d_2")))
  }

  pub fn without_conv() -> Arc<dyn Classifier> {
    Arc::new(Self::new(&NO_FRACTURE_SCORES, None))
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
      activations: Array3::from_shape_fn((4, 4, 1), |(y, x, _)| if y >= 2 && x >= 2 { 1.0 } else { 0.0 }),
      gradients: Array3::from_elem((4, 4, 1), 0.5),
      scores: ClassScores::from(self.scores.clone()),
      class_index,
    })
  }
}

pub fn encode(image: DynamicImage, format: ImageFormat) -> Vec<u8> {
  let mut bytes = Cursor::new(Vec::new());
  image.write_to(&mut bytes, format).unwrap();
  bytes.into_inner()
}

/// 带渐变纹理的灰度 JPEG
pub fn gray_jpeg(width: u32, height: u32) -> Vec<u8> {
  let image = GrayImage::from_fn(width, height, |x, y| Luma([((x * 3 + y * 5) % 200) as u8 + 20]));
  encode(DynamicImage::ImageLuma8(image), ImageFormat::Jpeg)
}

/// 黑底白色方块的 PNG，方块范围为 `[from, to)`
pub fn square_png(side: u32, from: u32, to: u32) -> Vec<u8> {
  let image = GrayImage::from_fn(side, side, |x, y| {
    if (from..to).contains(&x) && (from..to).contains(&y) {
      Luma([255])
    } else {
      Luma([0])
    }
  });
  encode(DynamicImage::ImageLuma8(image), ImageFormat::Png)
}

pub struct TensorSpec {
  pub name: String,
  pub shape: Vec<usize>,
  pub values: Vec<f32>,
}

impl TensorSpec {
  pub fn new(name: &str, shape: &[usize], values: Vec<f32>) -> Self {
    assert_eq!(shape.iter().product::<usize>(), values.len());
    Self {
      name: name.to_string(),
      shape: shape.to_vec(),
      values,
    }
  }
}

/// 写出 `<stem>.safetensors` 与同名 `.toml` 清单，返回权重文件路径
pub fn write_model(dir: &Path, stem: &str, manifest: &str, tensors: &[TensorSpec]) -> PathBuf {
  let bytes: Vec<Vec<u8>> = tensors
    .iter()
    .map(|t| t.values.iter().flat_map(|v| v.to_le_bytes()).collect())
    .collect();
  let views: Vec<(String, TensorView<'_>)> = tensors
    .iter()
    .zip(&bytes)
    .map(|(t, data)| {
      (
        t.name.clone(),
        TensorView::new(Dtype::F32, t.shape.clone(), data).unwrap(),
      )
    })
    .collect();
  let serialized = safetensors::serialize(views.iter().map(|(name, view)| (name.clone(), view)), &None).unwrap();

  let weights = dir.join(format!("{}.safetensors", stem));
  std::fs::write(&weights, serialized).unwrap();
  std::fs::write(weights.with_extension("toml"), manifest).unwrap();
  weights
}

pub const DENSE_MANIFEST: &str = r#"
input = [150, 150, 1]

[labels]
names = ["comminuted_fracture", "no_fracture", "simple_fracture"]

[[layers]]
kind = "flatten"
name = "flatten"

[[layers]]
kind = "dense"
name = "dense"
activation = "softmax"
"#;

/// 没有卷积层的模型，softmax 偏置取对数概率，输出恒为 `scores`
pub fn write_dense_model(dir: &Path, scores: [f32; 3]) -> PathBuf {
  let features = 150 * 150;
  write_model(
    dir,
    "dense",
    DENSE_MANIFEST,
    &[
      TensorSpec::new("dense.kernel", &[features, 3], vec![0.0; features * 3]),
      TensorSpec::new("dense.bias", &[3], scores.iter().map(|s| s.ln()).collect()),
    ],
  )
}

pub const CONV_MANIFEST: &str = r#"
input = [150, 150, 1]

[labels]
names = ["comminuted_fracture", "no_fracture", "simple_fracture"]
sorted = true

[[layers]]
kind = "conv2d"
name = "conv2d"
activation = "relu"

[[layers]]
kind = "max_pool2d"
name = "max_pooling2d"
pool = [2, 2]

[[layers]]
kind = "flatten"
name = "flatten"

[[layers]]
kind = "dropout"
name = "dropout"
rate = 0.5

[[layers]]
kind = "dense"
name = "dense"
activation = "softmax"
"#;

/// 一层 3x3 卷积：通道 0 复制输入像素，通道 1 恒为零；
/// 全连接层只给 `no_fracture` 正权重，因此 Grad-CAM 热力图与输入亮度成正比
pub fn write_conv_model(dir: &Path) -> PathBuf {
  let mut kernel = vec![0.0f32; 3 * 3 * 2];
  // [kh, kw, in, out] 布局，中心点 (1, 1) 的第 0 个输出通道
  kernel[8] = 1.0;
  let features = 74 * 74 * 2;
  let dense: Vec<f32> = (0..features * 3)
    .map(|i| if i % 3 == 1 { 0.01 } else { 0.0 })
    .collect();

  write_model(
    dir,
    "conv",
    CONV_MANIFEST,
    &[
      TensorSpec::new("conv2d.kernel", &[3, 3, 1, 2], kernel),
      TensorSpec::new("conv2d.bias", &[2], vec![0.0, 0.0]),
      TensorSpec::new("dense.kernel", &[features, 3], dense),
      TensorSpec::new("dense.bias", &[3], vec![0.0, 1.0, 0.0]),
    ],
  )
}
