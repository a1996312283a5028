// 该文件是 Guzhe （骨折识别） 项目的一部分。
// src/server.rs - HTTP 推理服务
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

use rocket::{
  Build, Config, FromForm, Responder, Rocket, State,
  config::LogLevel,
  data::{Limits, ToByteUnit},
  form::{self, Form},
  fs::{FileServer, TempFile},
  get, post, routes,
  serde::json::Json,
};
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
  config::ServerConfig,
  pipeline::{Pipeline, PipelineError},
  response::{
    ErrorResponse, NO_IMAGE_PROVIDED, PREDICTION_FAILED, PREPROCESS_FAILED, PredictionResponse,
  },
};

/// 上传文件挂载点
pub const UPLOADS_ROUTE: &str = "/uploads";

#[derive(FromForm)]
pub struct Upload<'r> {
  image: Option<TempFile<'r>>,
}

#[derive(Responder)]
pub enum PredictReply {
  #[response(status = 200)]
  Ok(Json<PredictionResponse>),
  #[response(status = 400)]
  BadRequest(Json<ErrorResponse>),
  #[response(status = 500)]
  Failed(Json<ErrorResponse>),
}

impl PredictReply {
  fn bad_request() -> Self {
    Self::BadRequest(Json(ErrorResponse::new(NO_IMAGE_PROVIDED)))
  }

  fn failed(message: &str) -> Self {
    Self::Failed(Json(ErrorResponse::new(message)))
  }
}

impl From<PipelineError> for PredictReply {
  fn from(err: PipelineError) -> Self {
    match err {
      PipelineError::InputMissing => Self::bad_request(),
      PipelineError::Decode(_) => Self::failed(PREPROCESS_FAILED),
      PipelineError::Classifier(_) | PipelineError::Select(_) => Self::failed(PREDICTION_FAILED),
    }
  }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
  pub status: &'static str,
  pub labels: Vec<String>,
}

async fn read_upload(file: &TempFile<'_>) -> std::io::Result<Vec<u8>> {
  let reader = file.open().await?;
  tokio::pin!(reader);
  let mut bytes = Vec::with_capacity(file.len() as usize);
  reader.read_to_end(&mut bytes).await?;
  Ok(bytes)
}

#[post("/predict", data = "<upload>")]
pub async fn predict(
  upload: Result<Form<Upload<'_>>, form::Errors<'_>>,
  pipeline: &State<Arc<Pipeline>>,
) -> PredictReply {
  let id = Uuid::new_v4();

  let file = match upload {
    Ok(form) => form.into_inner().image,
    Err(e) => {
      warn!("[{}] 无法解析上传表单: {}", id, e);
      None
    }
  };
  let Some(file) = file.filter(|f| f.len() > 0) else {
    info!("[{}] 请求中没有图像", id);
    return PredictReply::bad_request();
  };

  let bytes = match read_upload(&file).await {
    Ok(bytes) => bytes,
    Err(e) => {
      error!("[{}] 读取上传文件失败: {}", id, e);
      return PredictReply::failed(PREPROCESS_FAILED);
    }
  };
  debug!("[{}] 收到图像: {} 字节", id, bytes.len());

  let pipeline = Arc::clone(pipeline.inner());
  let now = std::time::Instant::now();
  let result = tokio::task::spawn_blocking(move || pipeline.run(&bytes)).await;
  match result {
    Ok(Ok(output)) => {
      info!("[{}] 请求完成，耗时: {:.2?}", id, now.elapsed());
      PredictReply::Ok(Json(PredictionResponse::new(
        output.prediction,
        output.annotated.as_deref(),
      )))
    }
    Ok(Err(e)) => {
      match &e {
        PipelineError::Decode(_) => warn!("[{}] {}", id, e),
        _ => error!("[{}] {}", id, e),
      }
      e.into()
    }
    Err(e) => {
      error!("[{}] 推理任务异常退出: {}", id, e);
      PredictReply::failed(PREDICTION_FAILED)
    }
  }
}

/// 请求体不是表单时的兜底路由
#[post("/predict", rank = 2)]
pub fn predict_without_form() -> PredictReply {
  info!("请求体不是 multipart 表单");
  PredictReply::bad_request()
}

#[get("/health")]
pub fn health(pipeline: &State<Arc<Pipeline>>) -> Json<HealthResponse> {
  Json(HealthResponse {
    status: "ok",
    labels: pipeline.classifier().labels().names().to_vec(),
  })
}

/// 构建服务实例，上传目录不存在时先创建
pub fn build(pipeline: Arc<Pipeline>, config: &ServerConfig) -> std::io::Result<Rocket<Build>> {
  std::fs::create_dir_all(&config.uploads)?;

  let limits = Limits::default()
    .limit("file", config.max_upload_bytes.bytes())
    .limit("data-form", config.max_upload_bytes.bytes());
  let rocket_config = Config {
    address: config.address,
    port: config.port,
    limits,
    log_level: if config.verbose {
      LogLevel::Normal
    } else {
      LogLevel::Critical
    },
    ..Config::default()
  };

  Ok(
    rocket::custom(rocket_config)
      .manage(pipeline)
      .mount("/", routes![predict, predict_without_form, health])
      .mount(UPLOADS_ROUTE, FileServer::from(&config.uploads)),
  )
}

pub async fn run_server(pipeline: Arc<Pipeline>, config: ServerConfig) -> anyhow::Result<()> {
  info!("服务地址: http://{}:{}", config.address, config.port);
  info!("标注图像目录: {}", config.uploads.display());
  info!("接口:");
  info!("  POST /predict - 骨折识别");
  info!("  GET  /health - 服务状态");
  info!("  GET  {}/<file> - 标注图像", UPLOADS_ROUTE);

  build(pipeline, &config)?
    .launch()
    .await
    .map_err(|e| anyhow::anyhow!("服务启动失败: {}", e))?;

  info!("服务已停止");
  Ok(())
}
