// 该文件是 Guzhe （骨折识别） 项目的一部分。
// src/config.rs - 项目参数配置
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

use std::{
  net::{IpAddr, Ipv4Addr},
  path::PathBuf,
};

use clap::{Args, Parser};
use url::Url;

use crate::{output::DEFAULT_UPLOAD_DIR, pipeline::PipelineConfig};

pub const DEFAULT_MODEL_URL: &str = "cnn:models/fracture_model.safetensors";
pub const DEFAULT_PORT: u16 = 5002;
pub const DEFAULT_MAX_UPLOAD_MIB: u64 = 16;

/// 模型参数，服务端与命令行共用
#[derive(Args, Debug, Clone)]
pub struct ModelArgs {
  /// 模型地址，默认 cnn:models/fracture_model.safetensors
  /// 清单默认为同名 .toml 文件（即 models/fracture_model.toml），可用 ?manifest=PATH 指定
  #[arg(long, value_name = "MODEL", default_value = DEFAULT_MODEL_URL)]
  pub model: Url,

  /// Grad-CAM 目标层名称（默认使用最后一个卷积层）
  #[arg(long, value_name = "LAYER")]
  pub target_layer: Option<String>,
}

/// Guzhe 骨折识别服务
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct ServeArgs {
  #[command(flatten)]
  pub model: ModelArgs,

  /// 标注图像保存目录
  #[arg(long, value_name = "DIR", default_value = DEFAULT_UPLOAD_DIR)]
  pub uploads: PathBuf,

  /// 监听地址
  #[arg(long, value_name = "ADDRESS", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
  pub address: IpAddr,

  /// 监听端口
  #[arg(long, value_name = "PORT", default_value_t = DEFAULT_PORT)]
  pub port: u16,

  /// 关闭 Grad-CAM 标注
  #[arg(long)]
  pub no_annotate: bool,

  /// 上传文件大小上限 (MiB)
  #[arg(long, value_name = "MIB", default_value_t = DEFAULT_MAX_UPLOAD_MIB)]
  pub max_upload_mib: u64,

  /// 输出详细日志（包括 Rocket 自身日志）
  #[arg(short, long)]
  pub verbose: bool,
}

/// HTTP 服务配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
  pub address: IpAddr,
  pub port: u16,
  pub uploads: PathBuf,
  pub max_upload_bytes: u64,
  pub verbose: bool,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
      port: DEFAULT_PORT,
      uploads: PathBuf::from(DEFAULT_UPLOAD_DIR),
      max_upload_bytes: DEFAULT_MAX_UPLOAD_MIB * 1024 * 1024,
      verbose: false,
    }
  }
}

impl ServeArgs {
  pub fn pipeline_config(&self) -> PipelineConfig {
    PipelineConfig {
      annotate: !self.no_annotate,
      target_layer: self.model.target_layer.clone(),
      uploads: self.uploads.clone(),
    }
  }

  pub fn server_config(&self) -> ServerConfig {
    ServerConfig {
      address: self.address,
      port: self.port,
      uploads: self.uploads.clone(),
      max_upload_bytes: self.max_upload_mib.saturating_mul(1024 * 1024),
      verbose: self.verbose,
    }
  }
}

/// Guzhe 单张图像骨折识别
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct PredictArgs {
  #[command(flatten)]
  pub model: ModelArgs,

  /// 保存 Grad-CAM 标注图像的目录，不指定则不做标注
  #[arg(long, value_name = "DIR")]
  pub annotate: Option<PathBuf>,

  /// 输出易读的结果而不是 JSON
  #[arg(long)]
  pub pretty: bool,

  /// 待识别的 X 光图像
  #[arg(value_name = "IMAGE")]
  pub image: PathBuf,
}

impl PredictArgs {
  pub fn pipeline_config(&self) -> PipelineConfig {
    PipelineConfig {
      annotate: self.annotate.is_some(),
      target_layer: self.model.target_layer.clone(),
      uploads: self
        .annotate
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_UPLOAD_DIR)),
    }
  }
}
