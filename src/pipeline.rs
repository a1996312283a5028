// 该文件是 Guzhe （骨折识别） 项目的一部分。
// src/pipeline.rs - 推理流水线
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

use std::{path::PathBuf, sync::Arc};

use image::RgbImage;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
  explain::{SaliencyError, compute_heatmap},
  frame::InputTensor,
  input::{DecodeError, decode_image},
  model::{Classifier, ClassifierError, Prediction, SelectError, select},
  output::{AnnotationError, DEFAULT_UPLOAD_DIR, RegionAnnotator, StoreError, UploadStore},
};

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("没有提供图像")]
  InputMissing,
  #[error("图像预处理失败: {0}")]
  Decode(#[from] DecodeError),
  #[error("分类器错误: {0}")]
  Classifier(#[from] ClassifierError),
  #[error("预测选择失败: {0}")]
  Select(#[from] SelectError),
}

/// 标注阶段内部错误，只记录日志，不向调用方传播
#[derive(Error, Debug)]
enum AnnotateStageError {
  #[error("{0}")]
  Saliency(#[from] SaliencyError),
  #[error("{0}")]
  Annotation(#[from] AnnotationError),
  #[error("{0}")]
  Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
  /// 是否执行 Grad-CAM 标注阶段
  pub annotate: bool,
  /// Grad-CAM 目标层，缺省为最后一个卷积层
  pub target_layer: Option<String>,
  pub uploads: PathBuf,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      annotate: true,
      target_layer: None,
      uploads: PathBuf::from(DEFAULT_UPLOAD_DIR),
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutput {
  pub prediction: Prediction,
  /// 标注图像路径，标注阶段关闭或失败时为 `None`
  pub annotated: Option<PathBuf>,
}

/// 预测为必经阶段，标注为可选阶段。
///
/// 分类器只读共享，`run` 可以在多个线程上同时调用。
pub struct Pipeline {
  classifier: Arc<dyn Classifier>,
  annotator: RegionAnnotator,
  store: UploadStore,
  config: PipelineConfig,
}

impl Pipeline {
  pub fn new(classifier: Arc<dyn Classifier>, config: PipelineConfig) -> Self {
    Self {
      classifier,
      annotator: RegionAnnotator::default(),
      store: UploadStore::new(config.uploads.clone()),
      config,
    }
  }

  pub fn classifier(&self) -> &dyn Classifier {
    self.classifier.as_ref()
  }

  pub fn config(&self) -> &PipelineConfig {
    &self.config
  }

  pub fn store(&self) -> &UploadStore {
    &self.store
  }

  pub fn run(&self, bytes: &[u8]) -> Result<PipelineOutput, PipelineError> {
    if bytes.is_empty() {
      return Err(PipelineError::InputMissing);
    }

    let decoded = decode_image(bytes)?;
    let prediction = self.predict(&decoded.tensor)?;
    info!(
      "预测结果: {} ({:.2}%)",
      prediction.label,
      prediction.confidence * 100.0
    );

    let annotated = if self.config.annotate {
      self.annotate(&decoded.tensor, &decoded.color)
    } else {
      None
    };

    Ok(PipelineOutput {
      prediction,
      annotated,
    })
  }

  fn predict(&self, tensor: &InputTensor) -> Result<Prediction, PipelineError> {
    let now = std::time::Instant::now();
    let scores = self
      .classifier
      .predict(tensor)
      .inspect_err(|e| error!("推理失败: {}", e))?;
    debug!("推理完成，耗时: {:.2?}, 分数: {:?}", now.elapsed(), scores.as_slice());
    Ok(select(&scores, self.classifier.labels())?)
  }

  fn annotate(&self, tensor: &InputTensor, color: &RgbImage) -> Option<PathBuf> {
    match self.try_annotate(tensor, color) {
      Ok(path) => Some(path),
      Err(e) => {
        warn!("标注失败，返回不含标注的结果: {}", e);
        None
      }
    }
  }

  fn try_annotate(&self, tensor: &InputTensor, color: &RgbImage) -> Result<PathBuf, AnnotateStageError> {
    let now = std::time::Instant::now();
    let heatmap = compute_heatmap(
      tensor,
      self.classifier.as_ref(),
      self.config.target_layer.as_deref(),
    )?;
    let annotation = self.annotator.annotate(color, &heatmap)?;
    debug!(
      "标注完成，耗时: {:.2?}, 区域: {:?}",
      now.elapsed(),
      annotation.region
    );
    Ok(self.store.save(&annotation.image)?)
  }
}

#[cfg(test)]
mod tests {
  use std::io::Cursor;

  use image::{DynamicImage, GrayImage, ImageFormat, Luma};

  use super::*;
  use crate::{model::Sequential, testing::FixedClassifier};

  const FRACTURE_LABELS: [&str; 3] = ["comminuted_fracture", "no_fracture", "simple_fracture"];

  fn fixed(conv: bool) -> Arc<dyn Classifier> {
    let classifier = FixedClassifier::new(FRACTURE_LABELS, &[0.02, 0.95, 0.03]);
    Arc::new(if conv { classifier } else { classifier.without_conv() })
  }

  fn jpeg(width: u32, height: u32) -> Vec<u8> {
    let image = GrayImage::from_fn(width, height, |x, y| Luma([((x + y) % 256) as u8]));
    let mut bytes = Cursor::new(Vec::new());
    DynamicImage::ImageLuma8(image)
      .write_to(&mut bytes, ImageFormat::Jpeg)
      .unwrap();
    bytes.into_inner()
  }

  fn config(uploads: PathBuf, annotate: bool) -> PipelineConfig {
    PipelineConfig {
      annotate,
      target_layer: None,
      uploads,
    }
  }

  #[test]
  fn classifiers_are_shareable_across_threads() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<Sequential>();
    assert_send_sync::<Pipeline>();
  }

  #[test]
  fn annotates_with_conv_layer() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::new(fixed(true), config(dir.path().to_path_buf(), true));
    let output = pipeline.run(&jpeg(300, 300)).unwrap();

    assert_eq!(output.prediction.label, "no_fracture");
    assert_eq!(output.prediction.confidence, 0.95);
    let path = output.annotated.expect("应当生成标注图像");
    assert!(path.starts_with(dir.path()));
    assert_eq!(image::open(&path).unwrap().width(), 300);
  }

  #[test]
  fn missing_conv_layer_degrades_to_no_annotation() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::new(fixed(false), config(dir.path().to_path_buf(), true));
    let output = pipeline.run(&jpeg(300, 300)).unwrap();

    assert_eq!(output.prediction.label, "no_fracture");
    assert_eq!(output.annotated, None);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
  }

  #[test]
  fn annotation_stage_can_be_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::new(fixed(true), config(dir.path().join("out"), false));
    let output = pipeline.run(&jpeg(64, 32)).unwrap();
    assert_eq!(output.annotated, None);
    assert!(!dir.path().join("out").exists());
  }

  #[test]
  fn empty_input_is_missing() {
    let pipeline = Pipeline::new(fixed(false), PipelineConfig::default());
    assert!(matches!(pipeline.run(&[]), Err(PipelineError::InputMissing)));
  }

  #[test]
  fn corrupt_input_is_decode_error() {
    let pipeline = Pipeline::new(fixed(false), PipelineConfig::default());
    assert!(matches!(
      pipeline.run(b"definitely not an image"),
      Err(PipelineError::Decode(_))
    ));
  }

  #[test]
  fn mismatched_scores_are_select_error() {
    let classifier = Arc::new(FixedClassifier::new(["a", "b"], &[0.1, 0.2, 0.7]).without_conv());
    let pipeline = Pipeline::new(classifier, PipelineConfig::default());
    assert!(matches!(
      pipeline.run(&jpeg(20, 20)),
      Err(PipelineError::Select(_))
    ));
  }
}
