//! Bundle 生命周期状态

use std::fmt;

use serde::{Deserialize, Serialize};

/// Bundle 状态
///
/// ```text
/// INSTALLED → RESOLVED → STARTING → ACTIVE → STOPPING → RESOLVED
///                                                      ↘ UNINSTALLED
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BundleState {
    /// 已安装
    #[default]
    Installed,
    /// 已解析
    Resolved,
    /// 正在启动
    Starting,
    /// 运行中
    Active,
    /// 正在停止
    Stopping,
    /// 已卸载（终态）
    Uninstalled,
}

impl BundleState {
    /// 是否可以解析
    pub fn can_resolve(&self) -> bool {
        matches!(self, BundleState::Installed)
    }

    /// 是否可以启动
    pub fn can_start(&self) -> bool {
        matches!(self, BundleState::Installed | BundleState::Resolved)
    }

    /// 是否可以停止
    pub fn can_stop(&self) -> bool {
        matches!(self, BundleState::Active)
    }

    /// 是否可以卸载
    pub fn can_uninstall(&self) -> bool {
        !matches!(self, BundleState::Uninstalled)
    }

    /// 是否处于启动中或运行中（允许注册服务）
    pub fn is_context_valid(&self) -> bool {
        matches!(
            self,
            BundleState::Starting | BundleState::Active | BundleState::Stopping
        )
    }
}

impl fmt::Display for BundleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BundleState::Installed => "INSTALLED",
            BundleState::Resolved => "RESOLVED",
            BundleState::Starting => "STARTING",
            BundleState::Active => "ACTIVE",
            BundleState::Stopping => "STOPPING",
            BundleState::Uninstalled => "UNINSTALLED",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        assert!(BundleState::Installed.can_resolve());
        assert!(!BundleState::Resolved.can_resolve());

        assert!(BundleState::Installed.can_start());
        assert!(BundleState::Resolved.can_start());
        assert!(!BundleState::Active.can_start());
        assert!(!BundleState::Starting.can_start());

        assert!(BundleState::Active.can_stop());
        assert!(!BundleState::Resolved.can_stop());

        assert!(!BundleState::Uninstalled.can_uninstall());
        assert!(BundleState::Active.can_uninstall());
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&BundleState::Active).unwrap();
        assert_eq!(json, "\"ACTIVE\"");
        assert_eq!(BundleState::Stopping.to_string(), "STOPPING");
    }
}
