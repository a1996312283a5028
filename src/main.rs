// 该文件是 Guzhe （骨折识别） 项目的一部分。
// src/main.rs - 推理服务主程序
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
use tokio::runtime::Runtime;
use tracing::{Level, info};

use guzhe::{
  FromUrl,
  config::ServeArgs,
  model::{Classifier, SequentialBuilder},
  pipeline::Pipeline,
  server::run_server,
};

fn main() -> Result<()> {
  let args = ServeArgs::parse();

  tracing_subscriber::fmt()
    .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
    .init();

  info!("Guzhe 骨折识别服务");
  info!("模型地址: {}", args.model.model);

  info!("正在加载模型...");
  let now = std::time::Instant::now();
  let model = SequentialBuilder::from_url(&args.model.model)?
    .build()
    .context("模型加载失败")?;
  info!(
    "模型加载完成，耗时: {:.2?}, 类别: {:?}",
    now.elapsed(),
    model.labels().names()
  );

  let pipeline = Arc::new(Pipeline::new(Arc::new(model), args.pipeline_config()));
  let runtime = Runtime::new()?;
  runtime.block_on(run_server(pipeline, args.server_config()))
}
