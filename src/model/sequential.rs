// 该文件是 Guzhe （骨折识别） 项目的一部分。
// src/model/sequential.rs - 顺序卷积网络及模型文件加载
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

use ndarray::{Array1, Array2, Array4};
use safetensors::{Dtype, SafeTensors, tensor::TensorView};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{INPUT_SIDE, InputTensor},
  model::{
    Activation, ClassScores, ClassTarget, Classifier, ClassifierError, Conv2d, Dense, LabelError,
    LabelTable, Layer, LayerError, LayerGradient, LayerKind, MaxPool2d, Padding, Shape, Tensor,
  },
};

/// 分类器训练时的输入形状 `[H, W, C]`
pub const CLASSIFIER_INPUT: [usize; 3] = [INPUT_SIDE as usize, INPUT_SIDE as usize, 1];

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("模型加载错误: {0}")]
  ModelLoadError(std::io::Error),
  #[error("权重文件无效: {0}")]
  Weights(#[from] safetensors::SafeTensorError),
  #[error("模型清单无效: {0}")]
  Manifest(#[from] toml::de::Error),
  #[error("缺少权重张量: {0}")]
  MissingTensor(String),
  #[error("权重张量 {name} 类型为 {dtype}, 仅支持 F32")]
  DType { name: String, dtype: String },
  #[error("权重张量 {name} 形状为 {shape:?}, 期望 {expected} 维")]
  Rank {
    name: String,
    shape: Vec<usize>,
    expected: usize,
  },
  #[error("网络层 {0} 无效: {1}")]
  InvalidLayer(String, String),
  #[error("网络结构错误: {0}")]
  Layer(#[from] LayerError),
  #[error("模型输入形状为 {actual:?}, 期望 {expected:?}")]
  InputShape {
    expected: [usize; 3],
    actual: [usize; 3],
  },
  #[error("模型最终输出为 {0}, 期望一维分数向量")]
  OutputShape(Shape),
  #[error("标签表错误: {0}")]
  Labels(#[from] LabelError),
  #[error("模型路径错误: {0}")]
  ModelPathError(String),
}

impl From<std::io::Error> for ModelError {
  fn from(err: std::io::Error) -> Self {
    ModelError::ModelLoadError(err)
  }
}

/// 与权重文件放在一起的 TOML 清单，描述网络结构与标签表
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
  pub input: [usize; 3],
  pub labels: LabelSection,
  pub layers: Vec<LayerSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LabelSection {
  pub names: Vec<String>,
  #[serde(default = "default_sorted")]
  pub sorted: bool,
}

fn default_sorted() -> bool {
  true
}

fn default_pool() -> [usize; 2] {
  [2, 2]
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LayerSpec {
  Conv2d {
    name: String,
    #[serde(default)]
    activation: Activation,
    #[serde(default)]
    padding: Padding,
  },
  MaxPool2d {
    name: String,
    #[serde(default = "default_pool")]
    pool: [usize; 2],
  },
  Flatten {
    name: String,
  },
  Dense {
    name: String,
    #[serde(default)]
    activation: Activation,
  },
  Dropout {
    name: String,
    #[serde(default)]
    rate: f32,
  },
}

impl Manifest {
  pub fn from_toml(text: &str) -> Result<Self, ModelError> {
    Ok(toml::from_str(text)?)
  }

  pub fn label_table(&self) -> Result<LabelTable, LabelError> {
    if self.labels.sorted {
      LabelTable::new_sorted(self.labels.names.iter().cloned())
    } else {
      LabelTable::new(self.labels.names.iter().cloned())
    }
  }
}

/// 顺序卷积网络，只实现推理与输入梯度
#[derive(Debug, Clone)]
pub struct Sequential {
  input: [usize; 3],
  layers: Vec<Layer>,
  labels: LabelTable,
  last_conv: Option<usize>,
}

impl Sequential {
  /// 校验层间形状衔接，以及最终输出数量与标签表一致
  pub fn new(input: [usize; 3], layers: Vec<Layer>, labels: LabelTable) -> Result<Self, ModelError> {
    let mut shape = Shape::Spatial(input);
    for layer in &layers {
      let next = layer.output_shape(shape)?;
      debug!("网络层 {}: {} -> {}", layer.name(), shape, next);
      shape = next;
    }

    match shape {
      Shape::Flat(outputs) => labels.check_outputs(outputs)?,
      other => return Err(ModelError::OutputShape(other)),
    }

    let last_conv = layers.iter().rposition(Layer::is_conv);
    Ok(Self {
      input,
      layers,
      labels,
      last_conv,
    })
  }

  pub fn input_shape(&self) -> [usize; 3] {
    self.input
  }

  pub fn layers(&self) -> &[Layer] {
    &self.layers
  }

  pub fn layer_index(&self, name: &str) -> Option<usize> {
    self.layers.iter().position(|layer| layer.name() == name)
  }

  pub fn forward(&self, input: Tensor) -> Result<Tensor, ClassifierError> {
    let mut current = input;
    for layer in &self.layers {
      current = layer.forward(&current)?;
    }
    Ok(current)
  }

  /// 求目标类别分数对第 `index` 层输出的梯度
  pub fn gradient_at(
    &self,
    input: Tensor,
    index: usize,
    target: ClassTarget,
  ) -> Result<LayerGradient, ClassifierError> {
    let target_layer = self
      .layers
      .get(index)
      .ok_or_else(|| ClassifierError::LayerNotFound(format!("#{}", index)))?;

    let mut current = input;
    for layer in &self.layers[..=index] {
      current = layer.forward(&current)?;
    }
    let activations = match &current {
      Tensor::Spatial(a) => a.clone(),
      Tensor::Flat(_) => {
        return Err(ClassifierError::NotSpatial(target_layer.name().to_string()));
      }
    };

    // trace[i] 是第 index + i 层的输出
    let head = &self.layers[index + 1..];
    let mut trace = Vec::with_capacity(head.len() + 1);
    trace.push(current);
    for layer in head {
      let next = layer.forward(&trace[trace.len() - 1])?;
      trace.push(next);
    }

    let scores = trace[trace.len() - 1]
      .as_flat()
      .ok_or(ClassifierError::OutputNotFlat)?
      .to_vec();
    let class_index = target.resolve(&scores)?;

    let mut grad = Tensor::Flat(Array1::from_shape_fn(scores.len(), |i| {
      if i == class_index { 1.0 } else { 0.0 }
    }));
    for (offset, layer) in head.iter().enumerate().rev() {
      grad = layer.backward(&trace[offset], &trace[offset + 1], grad)?;
    }

    let gradients = grad
      .into_spatial()
      .ok_or_else(|| ClassifierError::NotSpatial(target_layer.name().to_string()))?;

    Ok(LayerGradient {
      activations,
      gradients,
      scores: ClassScores::from(scores),
      class_index,
    })
  }

  fn check_input(&self, input: &InputTensor) -> Result<Tensor, ClassifierError> {
    let tensor = [input.height(), input.width(), input.channels()];
    if tensor != self.input {
      return Err(ClassifierError::InputShape {
        model: self.input,
        tensor,
      });
    }
    Ok(Tensor::Spatial(input.to_array()))
  }
}

impl Classifier for Sequential {
  fn labels(&self) -> &LabelTable {
    &self.labels
  }

  fn predict(&self, input: &InputTensor) -> Result<ClassScores, ClassifierError> {
    let output = self.forward(self.check_input(input)?)?;
    let scores = output.as_flat().ok_or(ClassifierError::OutputNotFlat)?;
    debug!("模型输出分数: {:?}", scores);
    Ok(ClassScores::from(scores.to_vec()))
  }

  fn last_conv_layer(&self) -> Option<&str> {
    self.last_conv.map(|index| self.layers[index].name())
  }

  fn layer_gradient(
    &self,
    input: &InputTensor,
    target_layer: &str,
    target: ClassTarget,
  ) -> Result<LayerGradient, ClassifierError> {
    let index = self
      .layer_index(target_layer)
      .ok_or_else(|| ClassifierError::LayerNotFound(target_layer.to_string()))?;
    self.gradient_at(self.check_input(input)?, index, target)
  }
}

/// 从 `cnn:` 地址加载模型：路径指向 safetensors 权重文件，
/// 清单默认是同名的 `.toml` 文件，可用 `?manifest=` 覆盖
#[derive(Debug, Clone)]
pub struct SequentialBuilder {
  weights_path: PathBuf,
  manifest_path: PathBuf,
  input: [usize; 3],
}

impl FromUrlWithScheme for SequentialBuilder {
  const SCHEME: &'static str = "cnn";
}

impl FromUrl for SequentialBuilder {
  type Error = ModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ModelError::ModelPathError(format!(
        "模型路径必须使用 {} 方案, 实际为 {}",
        Self::SCHEME,
        url.scheme()
      )));
    }

    let path = urlencoding::decode(url.path())
      .map_err(|e| ModelError::ModelPathError(format!("路径解码失败: {}", e)))?
      .into_owned();
    if path.is_empty() {
      return Err(ModelError::ModelPathError("模型路径为空".to_string()));
    }

    let mut builder = SequentialBuilder::from_path(&path);
    if let Some((_, manifest)) = url.query_pairs().find(|(k, _)| k == "manifest") {
      builder.manifest_path = PathBuf::from(manifest.into_owned());
    }
    Ok(builder)
  }
}

impl SequentialBuilder {
  pub fn from_path<P: AsRef<Path>>(weights: P) -> Self {
    let weights_path = weights.as_ref().to_path_buf();
    let manifest_path = weights_path.with_extension("toml");
    Self {
      weights_path,
      manifest_path,
      input: CLASSIFIER_INPUT,
    }
  }

  pub fn manifest(mut self, path: impl Into<PathBuf>) -> Self {
    self.manifest_path = path.into();
    self
  }

  /// 要求的输入形状，默认 `[150, 150, 1]`
  pub fn input_shape(mut self, input: [usize; 3]) -> Self {
    self.input = input;
    self
  }

  pub fn weights_path(&self) -> &Path {
    &self.weights_path
  }

  pub fn manifest_path(&self) -> &Path {
    &self.manifest_path
  }

  pub fn build(self) -> Result<Sequential, ModelError> {
    info!("加载模型清单: {}", self.manifest_path.display());
    let manifest = Manifest::from_toml(&std::fs::read_to_string(&self.manifest_path)?)?;
    if manifest.input != self.input {
      error!(
        "模型输入形状为 {:?}, 预处理输出为 {:?}",
        manifest.input, self.input
      );
      return Err(ModelError::InputShape {
        expected: self.input,
        actual: manifest.input,
      });
    }
    let labels = manifest.label_table()?;
    debug!("标签表: {:?}", labels.names());

    info!("加载权重文件: {}", self.weights_path.display());
    let data = std::fs::read(&self.weights_path)?;
    debug!(
      "权重文件大小: {:.2} MB",
      data.len() as f64 / (1024.0 * 1024.0)
    );
    let tensors = SafeTensors::deserialize(&data)?;

    let layers = manifest
      .layers
      .iter()
      .map(|spec| build_layer(spec, &tensors))
      .collect::<Result<Vec<_>, _>>()?;

    let model = Sequential::new(manifest.input, layers, labels)?;
    info!(
      "模型加载完成: {} 层, {} 个类别, 最后卷积层 {:?}",
      model.layers.len(),
      model.labels.len(),
      model.last_conv_layer()
    );
    Ok(model)
  }
}

fn build_layer(spec: &LayerSpec, tensors: &SafeTensors<'_>) -> Result<Layer, ModelError> {
  let layer = match spec {
    LayerSpec::Conv2d {
      name,
      activation,
      padding,
    } => {
      let (shape, kernel) = read_tensor(tensors, &format!("{}.kernel", name), 4)?;
      let (_, bias) = read_tensor(tensors, &format!("{}.bias", name), 1)?;
      let kernel = Array4::from_shape_vec((shape[0], shape[1], shape[2], shape[3]), kernel)
        .map_err(|e| ModelError::InvalidLayer(name.clone(), e.to_string()))?;
      let conv = Conv2d::new(kernel, Array1::from(bias), *activation, *padding)
        .map_err(|e| ModelError::InvalidLayer(name.clone(), e))?;
      Layer::new(name.as_str(), LayerKind::Conv2d(conv))
    }
    LayerSpec::MaxPool2d { name, pool } => {
      let pool = MaxPool2d::new((pool[0], pool[1]))
        .map_err(|e| ModelError::InvalidLayer(name.clone(), e))?;
      Layer::new(name.as_str(), LayerKind::MaxPool2d(pool))
    }
    LayerSpec::Flatten { name } => Layer::new(name.as_str(), LayerKind::Flatten),
    LayerSpec::Dense { name, activation } => {
      let (shape, kernel) = read_tensor(tensors, &format!("{}.kernel", name), 2)?;
      let (_, bias) = read_tensor(tensors, &format!("{}.bias", name), 1)?;
      let kernel = Array2::from_shape_vec((shape[0], shape[1]), kernel)
        .map_err(|e| ModelError::InvalidLayer(name.clone(), e.to_string()))?;
      let dense = Dense::new(kernel, Array1::from(bias), *activation)
        .map_err(|e| ModelError::InvalidLayer(name.clone(), e))?;
      Layer::new(name.as_str(), LayerKind::Dense(dense))
    }
    LayerSpec::Dropout { name, rate } => Layer::new(name.as_str(), LayerKind::Dropout { rate: *rate }),
  };
  Ok(layer)
}

fn read_tensor(
  tensors: &SafeTensors<'_>,
  name: &str,
  rank: usize,
) -> Result<(Vec<usize>, Vec<f32>), ModelError> {
  let view: TensorView<'_> = tensors
    .tensor(name)
    .map_err(|_| ModelError::MissingTensor(name.to_string()))?;

  if view.dtype() != Dtype::F32 {
    return Err(ModelError::DType {
      name: name.to_string(),
      dtype: format!("{:?}", view.dtype()),
    });
  }
  if view.shape().len() != rank {
    return Err(ModelError::Rank {
      name: name.to_string(),
      shape: view.shape().to_vec(),
      expected: rank,
    });
  }

  let values = view
    .data()
    .chunks_exact(4)
    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    .collect();
  Ok((view.shape().to_vec(), values))
}

#[cfg(test)]
mod tests {
  use ndarray::{Array3, array};

  use super::*;

  const MANIFEST: &str = r#"
input = [150, 150, 1]

[labels]
names = ["comminuted_fracture", "no_fracture", "simple_fracture"]

[[layers]]
kind = "conv2d"
name = "conv2d"
activation = "relu"

[[layers]]
kind = "max_pool2d"
name = "max_pooling2d"

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

  #[test]
  fn parses_manifest() {
    let manifest = Manifest::from_toml(MANIFEST).unwrap();
    assert_eq!(manifest.input, [150, 150, 1]);
    assert!(manifest.labels.sorted);
    assert_eq!(manifest.layers.len(), 5);
    assert!(matches!(
      manifest.layers[0],
      LayerSpec::Conv2d {
        activation: Activation::Relu,
        padding: Padding::Valid,
        ..
      }
    ));
    assert!(matches!(manifest.layers[1], LayerSpec::MaxPool2d { pool: [2, 2], .. }));
    assert_eq!(manifest.label_table().unwrap().len(), 3);
  }

  #[test]
  fn manifest_rejects_unsorted_labels() {
    let text = MANIFEST.replace(
      r#"["comminuted_fracture", "no_fracture", "simple_fracture"]"#,
      r#"["simple_fracture", "not_fractured", "communited_fracture"]"#,
    );
    let manifest = Manifest::from_toml(&text).unwrap();
    assert!(matches!(
      manifest.label_table(),
      Err(LabelError::NotSorted { .. })
    ));
  }

  #[test]
  fn rejects_label_count_mismatch() {
    let dense = Dense::new(Array2::zeros((4, 2)), Array1::zeros(2), Activation::Softmax).unwrap();
    let layers = vec![
      Layer::new("flatten", LayerKind::Flatten),
      Layer::new("dense", LayerKind::Dense(dense)),
    ];
    let labels = LabelTable::new(["a", "b", "c"]).unwrap();
    let err = Sequential::new([2, 2, 1], layers, labels).unwrap_err();
    assert!(matches!(
      err,
      ModelError::Labels(LabelError::CountMismatch {
        labels: 3,
        outputs: 2
      })
    ));
  }

  #[test]
  fn rejects_broken_layer_chain() {
    let dense = Dense::new(Array2::zeros((5, 2)), Array1::zeros(2), Activation::Softmax).unwrap();
    let layers = vec![
      Layer::new("flatten", LayerKind::Flatten),
      Layer::new("dense", LayerKind::Dense(dense)),
    ];
    let labels = LabelTable::new(["a", "b"]).unwrap();
    assert!(matches!(
      Sequential::new([2, 2, 1], layers, labels),
      Err(ModelError::Layer(LayerError::ShapeMismatch { .. }))
    ));
  }

  /// 最大池化 -> 展平 -> softmax 全连接
  fn small_head() -> Sequential {
    let kernel = Array2::from_shape_fn((8, 3), |(i, j)| ((i * 3 + j) as f32 * 0.37).sin());
    let dense = Dense::new(kernel, array![0.1f32, -0.2, 0.05], Activation::Softmax).unwrap();
    let layers = vec![
      Layer::new("max_pooling2d", LayerKind::MaxPool2d(MaxPool2d::new((2, 2)).unwrap())),
      Layer::new("flatten", LayerKind::Flatten),
      Layer::new("dense", LayerKind::Dense(dense)),
    ];
    let labels = LabelTable::new(["a", "b", "c"]).unwrap();
    Sequential::new([4, 4, 2], layers, labels).unwrap()
  }

  fn head_score(model: &Sequential, activations: &Array3<f32>, class: usize) -> f32 {
    let out = model.forward(Tensor::Spatial(activations.clone())).unwrap();
    out.as_flat().unwrap()[class]
  }

  #[test]
  fn gradient_matches_finite_differences() {
    let model = small_head();
    // 每个池化窗口内的取值间隔都远大于扰动步长
    let activations =
      Array3::from_shape_fn((4, 4, 2), |(y, x, c)| ((y * 4 + x) * 2 + c) as f32 * 0.1 + 0.05 * c as f32);

    // 以恒等前缀的方式在输入处求梯度：在 4x4x2 张量前插入一个 dropout 层
    let mut layers = vec![Layer::new("identity", LayerKind::Dropout { rate: 0.0 })];
    layers.extend(model.layers().iter().cloned());
    let wrapped = Sequential::new([4, 4, 2], layers, LabelTable::new(["a", "b", "c"]).unwrap()).unwrap();

    for class in 0..3 {
      let grad = wrapped
        .gradient_at(Tensor::Spatial(activations.clone()), 0, ClassTarget::Index(class))
        .unwrap();
      assert_eq!(grad.class_index, class);
      assert_eq!(grad.gradients.dim(), (4, 4, 2));

      let eps = 1e-2f32;
      for ((y, x, c), &analytic) in grad.gradients.indexed_iter() {
        let mut plus = activations.clone();
        plus[[y, x, c]] += eps;
        let mut minus = activations.clone();
        minus[[y, x, c]] -= eps;
        let numeric =
          (head_score(&model, &plus, class) - head_score(&model, &minus, class)) / (2.0 * eps);
        assert!(
          (numeric - analytic).abs() < 5e-3,
          "class {} at ({}, {}, {}): numeric {} analytic {}",
          class,
          y,
          x,
          c,
          numeric,
          analytic
        );
      }
    }
  }

  #[test]
  fn predicted_target_uses_arg_max_of_same_pass() {
    let model = small_head();
    let activations = Array3::from_shape_fn((4, 4, 2), |(y, x, c)| (y + x + c) as f32 * 0.2);
    let mut layers = vec![Layer::new("identity", LayerKind::Dropout { rate: 0.0 })];
    layers.extend(model.layers().iter().cloned());
    let wrapped = Sequential::new([4, 4, 2], layers, LabelTable::new(["a", "b", "c"]).unwrap()).unwrap();

    let grad = wrapped
      .gradient_at(Tensor::Spatial(activations), 0, ClassTarget::Predicted)
      .unwrap();
    assert_eq!(Some(grad.class_index), grad.scores.arg_max());
  }

  #[test]
  fn rejects_non_cnn_scheme() {
    let url = Url::parse("yolo26:model.rknn").unwrap();
    assert!(matches!(
      SequentialBuilder::from_url(&url),
      Err(ModelError::ModelPathError(_))
    ));
  }

  #[test]
  fn manifest_defaults_to_sidecar() {
    let url = Url::parse("cnn:models/fracture%20model.safetensors").unwrap();
    let builder = SequentialBuilder::from_url(&url).unwrap();
    assert_eq!(builder.weights_path(), Path::new("models/fracture model.safetensors"));
    assert_eq!(builder.manifest_path(), Path::new("models/fracture model.toml"));

    let url = Url::parse("cnn:///srv/fracture.safetensors?manifest=/etc/guzhe/model.toml").unwrap();
    let builder = SequentialBuilder::from_url(&url).unwrap();
    assert_eq!(builder.weights_path(), Path::new("/srv/fracture.safetensors"));
    assert_eq!(builder.manifest_path(), Path::new("/etc/guzhe/model.toml"));
  }
}
