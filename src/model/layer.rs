// 该文件是 Guzhe （骨折识别） 项目的一部分。
// src/model/layer.rs - 卷积网络层定义（前向与输入梯度）
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

use std::fmt;

use ndarray::{Array, Array1, Array2, Array3, Array4, Dimension, Zip};
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LayerError {
  #[error("层 {layer} 输入形状不匹配: 期望 {expected}, 实际 {actual}")]
  ShapeMismatch {
    layer: String,
    expected: String,
    actual: Shape,
  },
  #[error("层 {0} 参数无效: {1}")]
  InvalidParameter(String, String),
  #[error("数组形状错误: {0}")]
  Array(#[from] ndarray::ShapeError),
}

/// 单个样本的中间张量（批维度已去掉）
#[derive(Debug, Clone, PartialEq)]
pub enum Tensor {
  /// `[H, W, C]`
  Spatial(Array3<f32>),
  Flat(Array1<f32>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
  Spatial([usize; 3]),
  Flat(usize),
}

impl fmt::Display for Shape {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Shape::Spatial([h, w, c]) => write!(f, "[{}, {}, {}]", h, w, c),
      Shape::Flat(n) => write!(f, "[{}]", n),
    }
  }
}

impl Tensor {
  pub fn shape(&self) -> Shape {
    match self {
      Tensor::Spatial(a) => {
        let (h, w, c) = a.dim();
        Shape::Spatial([h, w, c])
      }
      Tensor::Flat(a) => Shape::Flat(a.len()),
    }
  }

  pub fn as_flat(&self) -> Option<&Array1<f32>> {
    match self {
      Tensor::Flat(a) => Some(a),
      Tensor::Spatial(_) => None,
    }
  }

  pub fn into_spatial(self) -> Option<Array3<f32>> {
    match self {
      Tensor::Spatial(a) => Some(a),
      Tensor::Flat(_) => None,
    }
  }

  fn all_finite(&self) -> bool {
    match self {
      Tensor::Spatial(a) => a.iter().all(|v| v.is_finite()),
      Tensor::Flat(a) => a.iter().all(|v| v.is_finite()),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
  #[default]
  Linear,
  Relu,
  Softmax,
}

impl Activation {
  pub fn apply<D: Dimension>(self, x: &mut Array<f32, D>) {
    match self {
      Activation::Linear => {}
      Activation::Relu => x.mapv_inplace(|v| v.max(0.0)),
      Activation::Softmax => {
        let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        x.mapv_inplace(|v| (v - max).exp());
        let sum = x.sum();
        if sum > 0.0 {
          x.mapv_inplace(|v| v / sum);
        }
      }
    }
  }

  /// 由激活输出和输出梯度求激活输入的梯度
  pub fn backward<D: Dimension>(self, output: &Array<f32, D>, grad: Array<f32, D>) -> Array<f32, D> {
    let mut grad = grad;
    match self {
      Activation::Linear => {}
      Activation::Relu => {
        Zip::from(&mut grad).and(output).for_each(|g, &o| {
          if o <= 0.0 {
            *g = 0.0;
          }
        });
      }
      Activation::Softmax => {
        // d y_j / d z_i = y_j (δ_ij - y_i)
        let dot = Zip::from(&grad)
          .and(output)
          .fold(0.0f32, |acc, &g, &o| acc + g * o);
        Zip::from(&mut grad)
          .and(output)
          .for_each(|g, &o| *g = o * (*g - dot));
      }
    }
    grad
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Padding {
  #[default]
  Valid,
  Same,
}

/// 步长为 1 的二维卷积，卷积核布局 `[kh, kw, in, out]`
#[derive(Debug, Clone)]
pub struct Conv2d {
  kernel_size: (usize, usize),
  in_channels: usize,
  kernel_matrix: Array2<f32>,
  bias: Array1<f32>,
  activation: Activation,
  padding: Padding,
}

struct ConvGeometry {
  out_h: usize,
  out_w: usize,
  pad_top: usize,
  pad_left: usize,
}

impl Conv2d {
  pub fn new(
    kernel: Array4<f32>,
    bias: Array1<f32>,
    activation: Activation,
    padding: Padding,
  ) -> Result<Self, String> {
    let (kh, kw, cin, cout) = kernel.dim();
    if kh == 0 || kw == 0 || cin == 0 || cout == 0 {
      return Err(format!("卷积核形状无效: {:?}", kernel.dim()));
    }
    if bias.len() != cout {
      return Err(format!("偏置长度 {} 与输出通道数 {} 不一致", bias.len(), cout));
    }
    if activation == Activation::Softmax {
      return Err("卷积层不支持 softmax 激活".to_string());
    }

    // 按逻辑顺序展开，行对应 (dy, dx, ci)
    let kernel_matrix =
      Array2::from_shape_vec((kh * kw * cin, cout), kernel.iter().copied().collect())
        .map_err(|e| e.to_string())?;

    Ok(Self {
      kernel_size: (kh, kw),
      in_channels: cin,
      kernel_matrix,
      bias,
      activation,
      padding,
    })
  }

  pub fn out_channels(&self) -> usize {
    self.bias.len()
  }

  fn geometry(&self, h: usize, w: usize) -> Option<ConvGeometry> {
    let (kh, kw) = self.kernel_size;
    match self.padding {
      Padding::Valid => {
        if h < kh || w < kw {
          return None;
        }
        Some(ConvGeometry {
          out_h: h - kh + 1,
          out_w: w - kw + 1,
          pad_top: 0,
          pad_left: 0,
        })
      }
      Padding::Same => Some(ConvGeometry {
        out_h: h,
        out_w: w,
        pad_top: (kh - 1) / 2,
        pad_left: (kw - 1) / 2,
      }),
    }
  }

  fn output_shape(&self, [h, w, c]: [usize; 3]) -> Option<[usize; 3]> {
    if c != self.in_channels {
      return None;
    }
    self
      .geometry(h, w)
      .map(|g| [g.out_h, g.out_w, self.out_channels()])
  }

  /// 遍历每个输出位置对应的输入位置，回调参数为 (行号, 列号, 输入坐标)
  fn for_each_tap<F: FnMut(usize, usize, (usize, usize, usize))>(
    &self,
    (h, w): (usize, usize),
    geometry: &ConvGeometry,
    mut f: F,
  ) {
    let (kh, kw) = self.kernel_size;
    let cin = self.in_channels;
    for oy in 0..geometry.out_h {
      for ox in 0..geometry.out_w {
        let row = oy * geometry.out_w + ox;
        for dy in 0..kh {
          let iy = (oy + dy) as isize - geometry.pad_top as isize;
          if iy < 0 || iy >= h as isize {
            continue;
          }
          for dx in 0..kw {
            let ix = (ox + dx) as isize - geometry.pad_left as isize;
            if ix < 0 || ix >= w as isize {
              continue;
            }
            let base = (dy * kw + dx) * cin;
            for ci in 0..cin {
              f(row, base + ci, (iy as usize, ix as usize, ci));
            }
          }
        }
      }
    }
  }

  pub fn forward(&self, input: &Array3<f32>) -> Option<Result<Array3<f32>, LayerError>> {
    let (h, w, _) = input.dim();
    self.output_shape([h, w, input.dim().2])?;
    let geometry = self.geometry(h, w)?;

    let mut cols = Array2::<f32>::zeros((geometry.out_h * geometry.out_w, self.kernel_matrix.nrows()));
    self.for_each_tap((h, w), &geometry, |row, col, idx| {
      cols[[row, col]] = input[idx];
    });

    let mut out = cols.dot(&self.kernel_matrix);
    out += &self.bias;
    Some(
      out
        .into_shape_with_order((geometry.out_h, geometry.out_w, self.out_channels()))
        .map(|mut out| {
          self.activation.apply(&mut out);
          out
        })
        .map_err(LayerError::from),
    )
  }

  pub fn backward(
    &self,
    input: &Array3<f32>,
    output: &Array3<f32>,
    grad: Array3<f32>,
  ) -> Result<Array3<f32>, LayerError> {
    let (h, w, _) = input.dim();
    let (out_h, out_w, cout) = output.dim();
    let grad_pre = self.activation.backward(output, grad);
    let grad_pre = grad_pre
      .as_standard_layout()
      .into_owned()
      .into_shape_with_order((out_h * out_w, cout))?;
    let grad_cols = grad_pre.dot(&self.kernel_matrix.t());

    let mut grad_input = Array3::<f32>::zeros(input.dim());
    if let Some(geometry) = self.geometry(h, w) {
      self.for_each_tap((h, w), &geometry, |row, col, idx| {
        grad_input[idx] += grad_cols[[row, col]];
      });
    }
    Ok(grad_input)
  }
}

/// 最大池化，步长等于池化窗口，边缘不足一个窗口的部分丢弃
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxPool2d {
  pool: (usize, usize),
}

impl MaxPool2d {
  pub fn new(pool: (usize, usize)) -> Result<Self, String> {
    if pool.0 == 0 || pool.1 == 0 {
      return Err(format!("池化窗口无效: {:?}", pool));
    }
    Ok(Self { pool })
  }

  fn output_shape(&self, [h, w, c]: [usize; 3]) -> Option<[usize; 3]> {
    let (ph, pw) = self.pool;
    let (oh, ow) = (h / ph, w / pw);
    if oh == 0 || ow == 0 {
      return None;
    }
    Some([oh, ow, c])
  }

  pub fn forward(&self, input: &Array3<f32>) -> Option<Array3<f32>> {
    let (h, w, c) = input.dim();
    let [oh, ow, _] = self.output_shape([h, w, c])?;
    let (ph, pw) = self.pool;
    Some(Array3::from_shape_fn((oh, ow, c), |(oy, ox, ch)| {
      let mut max = f32::NEG_INFINITY;
      for dy in 0..ph {
        for dx in 0..pw {
          max = max.max(input[[oy * ph + dy, ox * pw + dx, ch]]);
        }
      }
      max
    }))
  }

  /// 梯度只回传给窗口内第一个取到最大值的位置
  pub fn backward(&self, input: &Array3<f32>, output: &Array3<f32>, grad: &Array3<f32>) -> Array3<f32> {
    let (ph, pw) = self.pool;
    let mut grad_input = Array3::<f32>::zeros(input.dim());
    for ((oy, ox, ch), &max) in output.indexed_iter() {
      'window: for dy in 0..ph {
        for dx in 0..pw {
          let idx = (oy * ph + dy, ox * pw + dx, ch);
          if input[idx] == max {
            grad_input[idx] += grad[[oy, ox, ch]];
            break 'window;
          }
        }
      }
    }
    grad_input
  }
}

/// 全连接层，权重布局 `[in, out]`
#[derive(Debug, Clone)]
pub struct Dense {
  kernel: Array2<f32>,
  bias: Array1<f32>,
  activation: Activation,
}

impl Dense {
  pub fn new(kernel: Array2<f32>, bias: Array1<f32>, activation: Activation) -> Result<Self, String> {
    if kernel.ncols() != bias.len() {
      return Err(format!(
        "偏置长度 {} 与输出单元数 {} 不一致",
        bias.len(),
        kernel.ncols()
      ));
    }
    if kernel.nrows() == 0 || kernel.ncols() == 0 {
      return Err(format!("权重形状无效: {:?}", kernel.dim()));
    }
    Ok(Self {
      kernel,
      bias,
      activation,
    })
  }

  pub fn units(&self) -> usize {
    self.kernel.ncols()
  }

  pub fn inputs(&self) -> usize {
    self.kernel.nrows()
  }

  pub fn forward(&self, input: &Array1<f32>) -> Array1<f32> {
    let mut out = input.dot(&self.kernel) + &self.bias;
    self.activation.apply(&mut out);
    out
  }

  pub fn backward(&self, output: &Array1<f32>, grad: Array1<f32>) -> Array1<f32> {
    let grad_pre = self.activation.backward(output, grad);
    self.kernel.dot(&grad_pre)
  }
}

#[derive(Debug, Clone)]
pub enum LayerKind {
  Conv2d(Conv2d),
  MaxPool2d(MaxPool2d),
  /// 按 H、W、C 顺序展开
  Flatten,
  Dense(Dense),
  /// 推理时为恒等映射
  Dropout { rate: f32 },
}

#[derive(Debug, Clone)]
pub struct Layer {
  name: String,
  kind: LayerKind,
}

impl Layer {
  pub fn new(name: impl Into<String>, kind: LayerKind) -> Self {
    Self {
      name: name.into(),
      kind,
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn kind(&self) -> &LayerKind {
    &self.kind
  }

  pub fn is_conv(&self) -> bool {
    matches!(self.kind, LayerKind::Conv2d(_))
  }

  fn mismatch(&self, expected: &str, actual: Shape) -> LayerError {
    LayerError::ShapeMismatch {
      layer: self.name.clone(),
      expected: expected.to_string(),
      actual,
    }
  }

  /// 推导输出形状，用于加载时校验层与层之间是否衔接
  pub fn output_shape(&self, input: Shape) -> Result<Shape, LayerError> {
    match (&self.kind, input) {
      (LayerKind::Conv2d(conv), Shape::Spatial(dims)) => conv
        .output_shape(dims)
        .map(Shape::Spatial)
        .ok_or_else(|| {
          self.mismatch(
            &format!("[H, W, {}] 且不小于卷积核", conv.in_channels),
            input,
          )
        }),
      (LayerKind::MaxPool2d(pool), Shape::Spatial(dims)) => pool
        .output_shape(dims)
        .map(Shape::Spatial)
        .ok_or_else(|| self.mismatch("不小于池化窗口的空间张量", input)),
      (LayerKind::Flatten, Shape::Spatial([h, w, c])) => Ok(Shape::Flat(h * w * c)),
      (LayerKind::Dense(dense), Shape::Flat(n)) if n == dense.inputs() => {
        Ok(Shape::Flat(dense.units()))
      }
      (LayerKind::Dense(dense), _) => Err(self.mismatch(&format!("[{}]", dense.inputs()), input)),
      (LayerKind::Dropout { .. }, shape) => Ok(shape),
      (_, Shape::Flat(_)) => Err(self.mismatch("空间张量 [H, W, C]", input)),
    }
  }

  pub fn forward(&self, input: &Tensor) -> Result<Tensor, LayerError> {
    // 先按形状规则校验，后面的计算可以假定形状正确
    self.output_shape(input.shape())?;

    match (&self.kind, input) {
      (LayerKind::Conv2d(conv), Tensor::Spatial(x)) => match conv.forward(x) {
        Some(out) => Ok(Tensor::Spatial(out?)),
        None => Err(self.mismatch("合法的卷积输入", input.shape())),
      },
      (LayerKind::MaxPool2d(pool), Tensor::Spatial(x)) => pool
        .forward(x)
        .map(Tensor::Spatial)
        .ok_or_else(|| self.mismatch("合法的池化输入", input.shape())),
      (LayerKind::Flatten, Tensor::Spatial(x)) => Ok(Tensor::Flat(x.iter().copied().collect())),
      (LayerKind::Dense(dense), Tensor::Flat(x)) => Ok(Tensor::Flat(dense.forward(x))),
      (LayerKind::Dropout { .. }, x) => Ok(x.clone()),
      _ => Err(self.mismatch("与层类型匹配的张量", input.shape())),
    }
  }

  /// 已知本层输入、输出和输出梯度，求输入梯度
  pub fn backward(&self, input: &Tensor, output: &Tensor, grad: Tensor) -> Result<Tensor, LayerError> {
    if grad.shape() != output.shape() {
      return Err(self.mismatch(&output.shape().to_string(), grad.shape()));
    }

    let grad_input = match (&self.kind, input, output, grad) {
      (LayerKind::Conv2d(conv), Tensor::Spatial(x), Tensor::Spatial(y), Tensor::Spatial(g)) => {
        Tensor::Spatial(conv.backward(x, y, g)?)
      }
      (LayerKind::MaxPool2d(pool), Tensor::Spatial(x), Tensor::Spatial(y), Tensor::Spatial(g)) => {
        Tensor::Spatial(pool.backward(x, y, &g))
      }
      (LayerKind::Flatten, Tensor::Spatial(x), _, Tensor::Flat(g)) => {
        Tensor::Spatial(Array3::from_shape_vec(x.dim(), g.to_vec())?)
      }
      (LayerKind::Dense(dense), _, Tensor::Flat(y), Tensor::Flat(g)) => {
        Tensor::Flat(dense.backward(y, g))
      }
      (LayerKind::Dropout { .. }, _, _, g) => g,
      _ => return Err(self.mismatch("与层类型匹配的张量", input.shape())),
    };

    if !grad_input.all_finite() {
      return Err(LayerError::InvalidParameter(
        self.name.clone(),
        "梯度中出现非有限值".to_string(),
      ));
    }
    Ok(grad_input)
  }
}
