use thiserror::Error;

/// 应用程序错误类型
#[derive(Error, Debug)]
pub enum AppError {
    /// 无法连接目录服务或上报平台
    #[error("连接错误: {0}")]
    Connectivity(String),

    /// 实例数据缺失或格式错误
    #[error("目录服务错误: {0}")]
    Directory(String),

    /// 事件订阅流失败
    #[error("事件订阅错误: {0}")]
    Subscription(String),

    /// 上报调用失败；`status` 为平台返回的HTTP状态码
    #[error("上传错误: {message}")]
    Upload { status: Option<u16>, message: String },

    #[error("配置错误: {0}")]
    Config(String),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("内部错误: {0}")]
    Internal(#[from] anyhow::Error),
}

/// 应用程序Result类型别名
pub type AppResult<T> = Result<T, AppError>;

/// 错误构造辅助函数
impl AppError {
    pub fn connectivity<T: Into<String>>(msg: T) -> Self {
        Self::Connectivity(msg.into())
    }

    pub fn directory<T: Into<String>>(msg: T) -> Self {
        Self::Directory(msg.into())
    }

    pub fn subscription<T: Into<String>>(msg: T) -> Self {
        Self::Subscription(msg.into())
    }

    pub fn upload<T: Into<String>>(msg: T) -> Self {
        Self::Upload {
            status: None,
            message: msg.into(),
        }
    }

    pub fn upload_status<T: Into<String>>(status: u16, msg: T) -> Self {
        Self::Upload {
            status: Some(status),
            message: msg.into(),
        }
    }

    pub fn config<T: Into<String>>(msg: T) -> Self {
        Self::Config(msg.into())
    }

    /// 瞬时错误：连接失败、平台限流或5xx
    ///
    /// 平台明确拒绝（4xx）的请求重试也不会成功
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connectivity(_) => true,
            Self::Upload { status, .. } => match status {
                Some(code) => *code == 429 || *code >= 500,
                None => true,
            },
            _ => false,
        }
    }
}
