use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 自定义字段定义
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub id: i32,
    pub name: String,
}

/// 字段ID到字段名的映射
///
/// 进程启动时构建一次，之后只读，可通过 `Arc` 在各生产者间共享
#[derive(Debug, Clone, Default)]
pub struct TagMap {
    fields: HashMap<i32, String>,
}

impl TagMap {
    pub fn from_definitions<I>(definitions: I) -> Self
    where
        I: IntoIterator<Item = FieldDefinition>,
    {
        let fields = definitions
            .into_iter()
            .map(|def| (def.id, def.name))
            .collect();
        Self { fields }
    }

    pub fn get(&self, id: i32) -> Option<&str> {
        self.fields.get(&id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
