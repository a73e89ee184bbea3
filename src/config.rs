use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub mod directory;
pub mod export;
pub mod ingest;

pub use directory::DirectoryConfig;
pub use export::ExportConfig;
pub use ingest::{IngestConfig, RetryConfig, RetryExecutor};

/// 应用程序配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub directory: DirectoryConfig,
    pub ingest: IngestConfig,
    #[serde(default)]
    pub export: ExportConfig,
    /// 关闭两端的TLS证书校验
    #[serde(default)]
    pub insecure: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            directory: DirectoryConfig::default(),
            ingest: IngestConfig::default(),
            export: ExportConfig::default(),
            insecure: false,
        }
    }
}

impl Config {
    /// 从配置文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| AppError::config(format!("解析配置文件失败: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// 验证配置有效性
    pub fn validate(&self) -> AppResult<()> {
        if let Err(e) = self.directory.validate() {
            return Err(AppError::config(format!("目录服务配置无效: {}", e)));
        }

        if let Err(e) = self.ingest.validate() {
            return Err(AppError::config(format!("上报平台配置无效: {}", e)));
        }

        if let Err(e) = self.export.validate() {
            return Err(AppError::config(format!("导出配置无效: {}", e)));
        }

        Ok(())
    }

    /// 保存配置到文件
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> AppResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| AppError::config(format!("序列化配置失败: {}", e)))?;

        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// 打印已加载的配置，密码与密钥不输出
    pub fn log_summary(&self) {
        tracing::info!(
            url = %self.directory.url,
            username = %self.directory.username,
            password = "<hidden>",
            scope = %self.directory.scope,
            "目录服务配置"
        );
        tracing::info!(
            url = %self.ingest.url,
            key = %self.ingest.api_key,
            secret = "<hidden>",
            "上报平台配置"
        );
        if self.insecure {
            tracing::warn!("已关闭TLS证书校验");
        }
    }
}

/// 校验URL格式，供各子配置复用
pub(crate) fn validate_url(name: &str, url: &str) -> Result<(), String> {
    if url.is_empty() {
        return Err(format!("{} 不能为空", name));
    }
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(format!("{} 必须以 http:// 或 https:// 开头", name));
    }
    Ok(())
}
