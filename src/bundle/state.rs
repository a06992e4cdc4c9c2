//! bundle 生命周期状态
//!
//! 状态取位掩码值，调用方可以用 [`StateMask`] 一次查询多个状态。

use std::fmt;
use std::ops::BitOr;

use serde::{Deserialize, Serialize};

/// bundle 生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum BundleState {
    Uninstalled = 1,
    Installed = 2,
    Resolved = 4,
    Starting = 8,
    Stopping = 16,
    Active = 32,
}

impl BundleState {
    /// 位掩码值
    pub const fn bits(self) -> u32 {
        self as u32
    }

    /// 从位掩码值还原
    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            1 => Some(BundleState::Uninstalled),
            2 => Some(BundleState::Installed),
            4 => Some(BundleState::Resolved),
            8 => Some(BundleState::Starting),
            16 => Some(BundleState::Stopping),
            32 => Some(BundleState::Active),
            _ => None,
        }
    }

    /// 已解析（RESOLVED、STARTING、ACTIVE、STOPPING）
    pub fn is_resolved(self) -> bool {
        matches!(
            self,
            BundleState::Resolved | BundleState::Starting | BundleState::Active | BundleState::Stopping
        )
    }

    /// 停止操作会生效的状态
    pub fn is_stoppable(self) -> bool {
        matches!(self, BundleState::Starting | BundleState::Active)
    }
}

impl fmt::Display for BundleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BundleState::Uninstalled => "UNINSTALLED",
            BundleState::Installed => "INSTALLED",
            BundleState::Resolved => "RESOLVED",
            BundleState::Starting => "STARTING",
            BundleState::Stopping => "STOPPING",
            BundleState::Active => "ACTIVE",
        };
        write!(f, "{}", name)
    }
}

/// 状态掩码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateMask(u32);

impl StateMask {
    /// 所有状态
    pub const ALL: StateMask = StateMask(0b11_1111);
    /// 除 UNINSTALLED 外的所有状态
    pub const INSTALLED_ANY: StateMask = StateMask(0b11_1110);

    pub const fn from_bits(bits: u32) -> Self {
        StateMask(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, state: BundleState) -> bool {
        self.0 & state.bits() != 0
    }
}

impl From<BundleState> for StateMask {
    fn from(state: BundleState) -> Self {
        StateMask(state.bits())
    }
}

impl BitOr for BundleState {
    type Output = StateMask;

    fn bitor(self, rhs: BundleState) -> StateMask {
        StateMask(self.bits() | rhs.bits())
    }
}

impl BitOr<BundleState> for StateMask {
    type Output = StateMask;

    fn bitor(self, rhs: BundleState) -> StateMask {
        StateMask(self.0 | rhs.bits())
    }
}
