use serde::{Deserialize, Serialize};
use std::fmt;

/// 实例引用（目录服务中的托管对象ID）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceRef(pub String);

impl InstanceRef {
    pub fn new<T: Into<String>>(id: T) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 原始自定义字段值：字段ID + 值
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTag {
    pub key: i32,
    pub value: String,
}

impl RawTag {
    pub fn new<T: Into<String>>(key: i32, value: T) -> Self {
        Self {
            key,
            value: value.into(),
        }
    }
}

/// 实例当前状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRecord {
    pub reference: InstanceRef,
    pub name: String,
    /// 客户机IP，未知时为空串
    pub address: String,
    /// 按字段ID稳定排序
    pub tags: Vec<RawTag>,
}

impl InstanceRecord {
    pub fn new(
        reference: InstanceRef,
        name: impl Into<String>,
        address: impl Into<String>,
        mut tags: Vec<RawTag>,
    ) -> Self {
        // 目录服务返回的顺序不固定，统一排序后同一组标签总是产出相同的行
        tags.sort_by_key(|tag| tag.key);
        Self {
            reference,
            name: name.into(),
            address: address.into(),
            tags,
        }
    }

    pub fn has_address(&self) -> bool {
        !self.address.is_empty()
    }
}

/// 变更事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// 实例重命名
    Renamed,
    /// 自定义字段值变更
    TagChanged,
    /// 其他事件，忽略
    #[serde(other)]
    Other,
}

impl EventKind {
    /// 只有重命名与标签变更会影响导出行
    pub fn is_relevant(&self) -> bool {
        matches!(self, Self::Renamed | Self::TagChanged)
    }
}

/// 变更通知
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub kind: EventKind,
    pub instance: InstanceRef,
}

impl ChangeNotification {
    pub fn new(kind: EventKind, instance: InstanceRef) -> Self {
        Self { kind, instance }
    }
}
