use serde::{Deserialize, Serialize};

/// 目录服务（虚拟化平台清单网关）配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// 网关基础URL
    pub url: String,
    pub username: String,
    pub password: String,
    /// 枚举实例所用的根范围（数据中心）
    pub scope: String,
    /// 每次长轮询最多返回的事件数
    #[serde(default = "default_event_page_size")]
    pub event_page_size: u32,
    /// 长轮询服务端等待时间（秒）
    #[serde(default = "default_poll_wait_secs")]
    pub poll_wait_secs: u64,
}

fn default_event_page_size() -> u32 {
    10
}

fn default_poll_wait_secs() -> u64 {
    30
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            url: "https://vcenter.local".to_string(),
            username: "administrator@vsphere.local".to_string(),
            password: String::new(),
            scope: "Datacenter".to_string(),
            event_page_size: default_event_page_size(),
            poll_wait_secs: default_poll_wait_secs(),
        }
    }
}

impl DirectoryConfig {
    pub fn validate(&self) -> Result<(), String> {
        super::validate_url("directory url", &self.url)?;

        if self.scope.is_empty() {
            return Err("scope 不能为空".to_string());
        }

        if self.event_page_size == 0 {
            return Err("event_page_size 必须大于0".to_string());
        }

        Ok(())
    }
}
