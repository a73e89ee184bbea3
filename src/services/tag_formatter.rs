use tracing::info;

use crate::{
    error::AppResult,
    models::{InstanceRecord, RawTag, RowRecord, TagMap},
    services::directory_client::TagResolver,
};

/// 标签对之间的分隔符
///
/// 末尾也会输出一个分隔符，下游的旧版解析依赖这一格式
pub const TAG_SEPARATOR: char = ';';

/// 拉取自定义字段定义并构建只读映射
pub async fn load_tag_map(resolver: &dyn TagResolver) -> AppResult<TagMap> {
    let definitions = resolver.list_field_definitions().await?;
    let tag_map = TagMap::from_definitions(definitions);
    info!(fields = tag_map.len(), "已加载自定义字段定义");
    Ok(tag_map)
}

/// 将原始标签格式化为 `name=value;` 串
///
/// 字段ID在映射中不存在时跳过该标签，不影响整行导出。
/// 同名字段全部保留，不做去重。
pub fn format_tags(raw_tags: &[RawTag], tag_map: &TagMap) -> String {
    let mut out = String::new();
    for tag in raw_tags {
        let Some(name) = tag_map.get(tag.key) else {
            continue;
        };
        out.push_str(name);
        out.push('=');
        out.push_str(&tag.value);
        out.push(TAG_SEPARATOR);
    }
    out
}

/// 由实例当前状态构造导出行；没有地址的实例不产出行
pub fn build_row(instance: &InstanceRecord, tag_map: &TagMap, segment: &str) -> Option<RowRecord> {
    if !instance.has_address() {
        return None;
    }
    Some(RowRecord {
        address: instance.address.clone(),
        segment: segment.to_string(),
        name: instance.name.clone(),
        tags: format_tags(&instance.tags, tag_map),
    })
}
