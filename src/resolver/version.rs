//! 版本与版本范围
//!
//! 清单中的版本采用 `major[.minor[.micro[.qualifier]]]` 格式，
//! 映射到 [`semver::Version`]，限定符存放在构建元数据中。
//! 版本范围支持区间写法 `[1.0,2.0)`、`(1.0,2.0]`，
//! 裸版本 `1.0` 表示 `[1.0, ∞)`。

use std::fmt;

use semver::{BuildMetadata, Prerelease, Version};

use crate::utils::{CoreError, Result};

/// 解析清单版本
///
/// 空字符串视为 `0.0.0`。
pub fn parse_version(input: &str) -> Result<Version> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(Version::new(0, 0, 0));
    }

    let mut parts = input.splitn(4, '.');
    let mut numeric = [0u64; 3];
    for slot in numeric.iter_mut() {
        match parts.next() {
            Some(part) => {
                *slot = part
                    .parse::<u64>()
                    .map_err(|_| CoreError::InvalidVersion(input.to_string()))?;
            }
            None => break,
        }
    }

    let build = match parts.next() {
        Some(qualifier) if !qualifier.is_empty() => {
            // 限定符允许下划线，semver 构建元数据不允许
            BuildMetadata::new(&qualifier.replace('_', "-"))
                .map_err(|_| CoreError::InvalidVersion(input.to_string()))?
        }
        Some(_) => return Err(CoreError::InvalidVersion(input.to_string())),
        None => BuildMetadata::EMPTY,
    };

    Ok(Version {
        major: numeric[0],
        minor: numeric[1],
        patch: numeric[2],
        pre: Prerelease::EMPTY,
        build,
    })
}

/// 版本范围
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionRange {
    floor: Version,
    floor_inclusive: bool,
    ceiling: Option<Version>,
    ceiling_inclusive: bool,
}

impl VersionRange {
    /// 匹配任意版本的范围 `[0.0.0, ∞)`
    pub fn any() -> Self {
        Self::at_least(Version::new(0, 0, 0))
    }

    /// `[floor, ∞)`
    pub fn at_least(floor: Version) -> Self {
        Self {
            floor,
            floor_inclusive: true,
            ceiling: None,
            ceiling_inclusive: false,
        }
    }

    /// 仅匹配一个版本 `[v, v]`
    pub fn exact(version: Version) -> Self {
        Self {
            floor: version.clone(),
            floor_inclusive: true,
            ceiling: Some(version),
            ceiling_inclusive: true,
        }
    }

    /// 解析范围表达式
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim().trim_matches('"');
        if input.is_empty() {
            return Ok(Self::any());
        }

        let first = input.chars().next().unwrap_or_default();
        if first != '[' && first != '(' {
            return Ok(Self::at_least(parse_version(input)?));
        }

        let last = input.chars().last().unwrap_or_default();
        if last != ']' && last != ')' {
            return Err(CoreError::InvalidVersion(input.to_string()));
        }

        let body = &input[1..input.len() - 1];
        let (low, high) = body
            .split_once(',')
            .ok_or_else(|| CoreError::InvalidVersion(input.to_string()))?;

        let range = Self {
            floor: parse_version(low)?,
            floor_inclusive: first == '[',
            ceiling: Some(parse_version(high)?),
            ceiling_inclusive: last == ']',
        };

        if range.is_empty() {
            return Err(CoreError::InvalidVersion(input.to_string()));
        }
        Ok(range)
    }

    /// 版本是否落在范围内
    pub fn includes(&self, version: &Version) -> bool {
        let above_floor = if self.floor_inclusive {
            version >= &self.floor
        } else {
            version > &self.floor
        };
        if !above_floor {
            return false;
        }

        match self.ceiling {
            Some(ref ceiling) if self.ceiling_inclusive => version <= ceiling,
            Some(ref ceiling) => version < ceiling,
            None => true,
        }
    }

    /// 范围下界
    pub fn floor(&self) -> &Version {
        &self.floor
    }

    /// 范围上界（None 表示无上界）
    pub fn ceiling(&self) -> Option<&Version> {
        self.ceiling.as_ref()
    }

    fn is_empty(&self) -> bool {
        match self.ceiling {
            Some(ref ceiling) => {
                ceiling < &self.floor
                    || (ceiling == &self.floor && !(self.floor_inclusive && self.ceiling_inclusive))
            }
            None => false,
        }
    }
}

impl Default for VersionRange {
    fn default() -> Self {
        Self::any()
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ceiling {
            None => write!(f, "{}", self.floor),
            Some(ref ceiling) => write!(
                f,
                "{}{},{}{}",
                if self.floor_inclusive { '[' } else { '(' },
                self.floor,
                ceiling,
                if self.ceiling_inclusive { ']' } else { ')' }
            ),
        }
    }
}
