use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use hmac::{Hmac, Mac};
use reqwest::{Client, Url};
use sha2::{Digest, Sha256};
use tracing::{debug, error};

use crate::{
    config::{IngestConfig, RetryConfig, RetryExecutor},
    error::{AppError, AppResult},
};

type HmacSha256 = Hmac<Sha256>;

/// CMDB上传接口路径（拼接在 api_prefix 之后）
const UPLOAD_PATH: &str = "/assets/cmdb/upload";

/// 上传文件名
const UPLOAD_FILE_NAME: &str = "inventory.csv";

/// 上传语义
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadMode {
    /// 追加到已有清单
    Append,
    /// 整体替换已有清单
    Replace,
}

impl UploadMode {
    /// 对应 X-Tetration-Oper 字段值
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Append => "add",
            Self::Replace => "replace",
        }
    }
}

/// 上报平台客户端接口
#[async_trait::async_trait]
pub trait IngestClient: Send + Sync {
    /// 上传一批CSV，返回平台的状态文本
    async fn upload(&self, payload: Bytes, mode: UploadMode) -> AppResult<String>;
}

/// Tetration OpenAPI 客户端
#[derive(Debug, Clone)]
pub struct TetrationClient {
    http: Client,
    url: Url,
    api_key: String,
    api_secret: String,
    retry: RetryConfig,
}

impl TetrationClient {
    /// `insecure` 为真时不校验服务端证书
    pub fn new(config: &IngestConfig, insecure: bool) -> AppResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout())
            .danger_accept_invalid_certs(insecure)
            .build()
            .map_err(|e| AppError::config(format!("创建HTTP客户端失败: {}", e)))?;

        let base = config.url.trim_end_matches('/');
        let url = Url::parse(&format!("{}{}{}", base, config.api_prefix, UPLOAD_PATH))
            .map_err(|e| AppError::config(format!("上报平台URL无效: {}", e)))?;

        Ok(Self {
            http,
            url,
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            retry: config.retry.clone(),
        })
    }

    async fn upload_once(&self, payload: &Bytes, mode: UploadMode) -> AppResult<String> {
        let boundary = format!("{:032x}", rand::random::<u128>());
        let content_type = format!("multipart/form-data; boundary={}", boundary);
        let body = encode_multipart(&boundary, mode, payload);

        let checksum = hex::encode(Sha256::digest(&body));
        let timestamp = chrono::Utc::now()
            .format("%Y-%m-%dT%H:%M:%S+0000")
            .to_string();
        let signature = sign(
            &self.api_secret,
            "POST",
            self.url.path(),
            &checksum,
            &content_type,
            &timestamp,
        )?;

        let resp = self
            .http
            .post(self.url.clone())
            .header("Id", &self.api_key)
            .header("Authorization", signature)
            .header("Timestamp", &timestamp)
            .header("X-Tetration-Cksum", &checksum)
            .header("Content-Type", &content_type)
            .body(body)
            .send()
            .await
            .map_err(|e| AppError::connectivity(format!("上报平台请求失败: {}", e)))?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        debug!(%status, len = text.len(), operation = mode.operation(), "上报平台响应");

        if !status.is_success() {
            let preview = text.chars().take(200).collect::<String>();
            error!(%status, preview = %preview, "清单上传失败");
            return Err(AppError::upload_status(
                status.as_u16(),
                format!("HTTP {}, body_preview={}", status.as_u16(), preview),
            ));
        }

        if text.trim().is_empty() {
            Ok(format!("OK ({})", status.as_u16()))
        } else {
            Ok(text)
        }
    }
}

#[async_trait::async_trait]
impl IngestClient for TetrationClient {
    async fn upload(&self, payload: Bytes, mode: UploadMode) -> AppResult<String> {
        let client = self;
        let payload = &payload;
        RetryExecutor::new(self.retry.clone())
            .execute_with_retry(move || client.upload_once(payload, mode), "清单上传")
            .await
    }
}

/// 计算请求签名：对方法、路径、校验和、内容类型、时间戳做 HMAC-SHA256 后 base64
pub fn sign(
    secret: &str,
    method: &str,
    path: &str,
    checksum: &str,
    content_type: &str,
    timestamp: &str,
) -> AppResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AppError::config(format!("api_secret无效: {}", e)))?;
    let message = format!(
        "{}\n{}\n{}\n{}\n{}\n",
        method, path, checksum, content_type, timestamp
    );
    mac.update(message.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// 组装 multipart 请求体
///
/// 签名需要完整请求体的校验和，因此这里一次性生成字节
fn encode_multipart(boundary: &str, mode: UploadMode, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(payload.len() + 256);
    body.extend_from_slice(
        format!(
            "--{}\r\nContent-Disposition: form-data; name=\"X-Tetration-Oper\"\r\n\r\n{}\r\n",
            boundary,
            mode.operation()
        )
        .as_bytes(),
    );
    body.extend_from_slice(
        format!(
            "--{}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\nContent-Type: text/csv\r\n\r\n",
            boundary, UPLOAD_FILE_NAME
        )
        .as_bytes(),
    );
    body.extend_from_slice(payload);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    body
}
