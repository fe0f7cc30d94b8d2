//! Bundle 事件与框架事件

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bundle / 框架监听器 ID
pub type EventListenerId = u64;

/// Bundle 事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BundleEventType {
    /// 已安装
    Installed,
    /// 已解析
    Resolved,
    /// 正在启动
    Starting,
    /// 已启动
    Started,
    /// 正在停止
    Stopping,
    /// 已停止
    Stopped,
    /// 已更新
    Updated,
    /// 解析已撤销
    Unresolved,
    /// 已卸载
    Uninstalled,
}

impl fmt::Display for BundleEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BundleEventType::Installed => "INSTALLED",
            BundleEventType::Resolved => "RESOLVED",
            BundleEventType::Starting => "STARTING",
            BundleEventType::Started => "STARTED",
            BundleEventType::Stopping => "STOPPING",
            BundleEventType::Stopped => "STOPPED",
            BundleEventType::Updated => "UPDATED",
            BundleEventType::Unresolved => "UNRESOLVED",
            BundleEventType::Uninstalled => "UNINSTALLED",
        };
        f.write_str(s)
    }
}

/// Bundle 事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleEvent {
    /// 事件类型
    pub event_type: BundleEventType,
    /// Bundle ID
    pub bundle_id: i64,
    /// 符号名
    pub symbolic_name: String,
    /// 安装来源
    pub location: String,
    /// 发生时间
    pub timestamp: DateTime<Utc>,
}

impl BundleEvent {
    /// 创建事件
    pub fn new(
        event_type: BundleEventType,
        bundle_id: i64,
        symbolic_name: impl Into<String>,
        location: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            bundle_id,
            symbolic_name: symbolic_name.into(),
            location: location.into(),
            timestamp: Utc::now(),
        }
    }
}

/// 框架事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameworkEventType {
    /// 框架已启动
    Started,
    /// 错误
    Error,
    /// 警告
    Warning,
    /// 信息
    Info,
    /// 框架已停止
    Stopped,
}

/// 框架事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameworkEvent {
    /// 事件类型
    pub event_type: FrameworkEventType,
    /// 相关 Bundle ID（框架自身为 0）
    pub bundle_id: i64,
    /// 说明
    pub message: String,
    /// 发生时间
    pub timestamp: DateTime<Utc>,
}

impl FrameworkEvent {
    /// 创建事件
    pub fn new(event_type: FrameworkEventType, bundle_id: i64, message: impl Into<String>) -> Self {
        Self {
            event_type,
            bundle_id,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Bundle 监听器
pub type BundleListener = Arc<dyn Fn(&BundleEvent) + Send + Sync>;

/// 框架监听器
pub type FrameworkListener = Arc<dyn Fn(&FrameworkEvent) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = BundleEvent::new(BundleEventType::Started, 3, "org.chips.a", "/tmp/a");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "STARTED");
        assert_eq!(json["bundle_id"], 3);

        let event = FrameworkEvent::new(FrameworkEventType::Error, 0, "boom");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"ERROR\""));
        assert_eq!(BundleEventType::Uninstalled.to_string(), "UNINSTALLED");
    }
}
