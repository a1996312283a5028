// 该文件是 Guzhe （骨折识别） 项目的一部分。
// src/model/labels.rs - 类别标签表
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

use std::collections::HashSet;

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum LabelError {
  #[error("标签表为空")]
  Empty,
  #[error("标签重复: {0}")]
  Duplicate(String),
  #[error("标签未按字典序排列: 第 {index} 个标签 {current:?} 排在 {previous:?} 之后")]
  NotSorted {
    index: usize,
    previous: String,
    current: String,
  },
  #[error("标签数量 {labels} 与模型输出数量 {outputs} 不一致")]
  CountMismatch { labels: usize, outputs: usize },
}

/// 与分类器输出下标一一对应的类别名称表
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct LabelTable {
  names: Vec<String>,
}

impl LabelTable {
  /// 标签非空且互不相同
  pub fn new<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Result<Self, LabelError> {
    let names: Vec<String> = names.into_iter().map(Into::into).collect();
    if names.is_empty() {
      return Err(LabelError::Empty);
    }

    let mut seen = HashSet::with_capacity(names.len());
    for name in &names {
      if !seen.insert(name.as_str()) {
        return Err(LabelError::Duplicate(name.clone()));
      }
    }

    Ok(Self { names })
  }

  /// 训练时类别下标按目录名排序分配，因此要求标签严格升序
  pub fn new_sorted<S: Into<String>>(
    names: impl IntoIterator<Item = S>,
  ) -> Result<Self, LabelError> {
    let table = Self::new(names)?;
    for (index, pair) in table.names.windows(2).enumerate() {
      if pair[0] >= pair[1] {
        return Err(LabelError::NotSorted {
          index: index + 1,
          previous: pair[0].clone(),
          current: pair[1].clone(),
        });
      }
    }
    Ok(table)
  }

  pub fn check_outputs(&self, outputs: usize) -> Result<(), LabelError> {
    if self.names.len() != outputs {
      return Err(LabelError::CountMismatch {
        labels: self.names.len(),
        outputs,
      });
    }
    Ok(())
  }

  pub fn len(&self) -> usize {
    self.names.len()
  }

  pub fn is_empty(&self) -> bool {
    self.names.is_empty()
  }

  pub fn get(&self, index: usize) -> Option<&str> {
    self.names.get(index).map(String::as_str)
  }

  pub fn names(&self) -> &[String] {
    &self.names
  }
}
