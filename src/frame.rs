// 该文件是 Guzhe （骨折识别） 项目的一部分。
// src/frame.rs - NHWC 灰度张量帧定义
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

use ndarray::{Array3, ArrayView3};
use thiserror::Error;

use crate::input::AsNhwcFrame;

const GRAY_CHANNELS: usize = 1;

/// 分类器训练时使用的输入边长
pub const INPUT_SIDE: u32 = 150;

/// 分类器输入张量，形状 `[1, 150, 150, 1]`
pub type InputTensor = GrayNhwcFrame<INPUT_SIDE, INPUT_SIDE>;

#[derive(Error, Debug)]
#[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
pub struct FrameShapeError {
  pub expected: usize,
  pub actual: usize,
}

/// 批大小为 1 的单通道归一化帧，按 NHWC 排列，取值范围 `[0, 1]`
#[derive(Debug, Clone, PartialEq)]
pub struct GrayNhwcFrame<const W: u32, const H: u32> {
  data: Box<[f32]>,
}

impl<const W: u32, const H: u32> TryFrom<Vec<f32>> for GrayNhwcFrame<W, H> {
  type Error = FrameShapeError;

  fn try_from(data: Vec<f32>) -> Result<Self, Self::Error> {
    let expected = GRAY_CHANNELS * W as usize * H as usize;
    if data.len() != expected {
      return Err(FrameShapeError {
        expected,
        actual: data.len(),
      });
    }

    Ok(Self {
      data: data.into_boxed_slice(),
    })
  }
}

impl<const W: u32, const H: u32> Default for GrayNhwcFrame<W, H> {
  fn default() -> Self {
    let size = GRAY_CHANNELS * (W as usize) * (H as usize);
    let data = vec![0.0f32; size].into_boxed_slice();
    Self { data }
  }
}

impl<const W: u32, const H: u32> GrayNhwcFrame<W, H> {
  pub fn batch(&self) -> usize {
    1
  }

  pub fn height(&self) -> usize {
    H as usize
  }

  pub fn width(&self) -> usize {
    W as usize
  }

  pub fn channels(&self) -> usize {
    GRAY_CHANNELS
  }

  /// `[N, H, W, C]`
  pub fn shape(&self) -> [usize; 4] {
    [self.batch(), self.height(), self.width(), self.channels()]
  }

  /// 去掉批维度后的 `[H, W, C]` 视图
  pub fn view(&self) -> ArrayView3<'_, f32> {
    // 长度在构造时已经校验
    ArrayView3::from_shape((self.height(), self.width(), self.channels()), &self.data)
      .expect("帧数据长度与形状不一致")
  }

  pub fn to_array(&self) -> Array3<f32> {
    self.view().to_owned()
  }
}

impl<const W: u32, const H: u32> AsNhwcFrame<W, H> for GrayNhwcFrame<W, H> {
  fn as_nhwc(&self) -> &[f32] {
    &self.data
  }
}
