// 该文件是 Guzhe （骨折识别） 项目的一部分。
// src/bin/predict.rs - 单张图像识别命令行工具
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

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use guzhe::{
  FromUrl,
  config::PredictArgs,
  model::SequentialBuilder,
  pipeline::Pipeline,
  response::PredictionResponse,
};

const RULE_WIDTH: usize = 30;

fn pretty(response: &PredictionResponse) -> String {
  let rule = "=".repeat(RULE_WIDTH);
  let mut text = format!(
    "{rule}\n      ANALYSIS RESULT\n{rule}\n  Prediction:     {}\n  Confidence:     {:.2}%\n",
    response.prediction.replace('_', " ").to_uppercase(),
    response.confidence * 100.0,
  );
  if let Some(path) = &response.annotated_image_path {
    text.push_str(&format!("  Annotated:      {}\n", path));
  }
  text.push_str(&rule);
  text
}

fn main() -> Result<()> {
  // 日志写到 stderr, stdout 只输出结果
  tracing_subscriber::fmt().with_writer(std::io::stderr).init();

  let args = PredictArgs::parse();
  info!("模型地址: {}", args.model.model);
  info!("输入图像: {}", args.image.display());

  let model = SequentialBuilder::from_url(&args.model.model)?
    .build()
    .context("模型加载失败")?;
  let pipeline = Pipeline::new(Arc::new(model), args.pipeline_config());

  let bytes = std::fs::read(&args.image)
    .with_context(|| format!("无法读取图像文件: {}", args.image.display()))?;
  let output = pipeline.run(&bytes)?;
  let response = PredictionResponse::new(output.prediction, output.annotated.as_deref());

  if args.pretty {
    println!("{}", pretty(&response));
  } else if args.annotate.is_some() {
    println!("{}", serde_json::to_string(&response)?);
  } else {
    // 与服务端不同，未请求标注时不输出 annotatedImagePath
    println!(
      "{}",
      serde_json::json!({
        "prediction": response.prediction,
        "confidence": response.confidence,
      })
    );
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn pretty_block() {
    let response = PredictionResponse {
      prediction: "simple_fracture".to_string(),
      confidence: 0.8765,
      annotated_image_path: None,
    };
    let text = pretty(&response);
    assert!(text.contains("ANALYSIS RESULT"));
    assert!(text.contains("Prediction:     SIMPLE FRACTURE"));
    assert!(text.contains("Confidence:     87.65%"));
    assert!(!text.contains("Annotated"));
    assert!(text.starts_with(&"=".repeat(30)));
  }
}
