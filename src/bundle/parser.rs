//! 清单头部解析器
//!
//! 头部值由逗号分隔的子句组成，每个子句形如
//! `path(;path)*(;key=value|;key:=directive)*`，
//! 引号内的值可以包含逗号与分号。

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::utils::{CoreError, Result};

/// 符号名与包名：点分隔的标识段
static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_\-]+(\.[A-Za-z0-9_\-]+)*$").expect("合法的正则"));

/// 解析后的头部子句
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderClause {
    pub paths: Vec<String>,
    /// `key=value`
    pub attributes: BTreeMap<String, String>,
    /// `key:=value`
    pub directives: BTreeMap<String, String>,
}

impl HeaderClause {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn directive(&self, key: &str) -> Option<&str> {
        self.directives.get(key).map(String::as_str)
    }
}

/// 清单头部解析器
#[derive(Debug, Clone, Default)]
pub struct ManifestParser;

impl ManifestParser {
    /// 解析头部值为子句列表
    ///
    /// # Errors
    ///
    /// 引号未闭合、子句缺少路径或参数名为空时返回 `InvalidHeader`
    pub fn parse_clauses(header: &str, value: &str) -> Result<Vec<HeaderClause>> {
        let mut clauses = Vec::new();
        for raw_clause in split_unquoted(header, value, ',')? {
            if raw_clause.trim().is_empty() {
                continue;
            }

            let mut clause = HeaderClause::default();
            for piece in split_unquoted(header, &raw_clause, ';')? {
                let piece = piece.trim();
                if piece.is_empty() {
                    continue;
                }

                if let Some((key, value)) = piece.split_once(":=") {
                    let key = checked_key(header, key)?;
                    clause.directives.insert(key, unquote(value));
                } else if let Some((key, value)) = piece.split_once('=') {
                    let key = checked_key(header, key)?;
                    clause.attributes.insert(key, unquote(value));
                } else if clause.attributes.is_empty() && clause.directives.is_empty() {
                    clause.paths.push(piece.to_string());
                } else {
                    return Err(invalid(header, format!("路径 '{}' 出现在参数之后", piece)));
                }
            }

            if clause.paths.is_empty() {
                return Err(invalid(header, format!("子句 '{}' 缺少路径", raw_clause.trim())));
            }
            clauses.push(clause);
        }
        Ok(clauses)
    }

    /// 解析只有一个子句的头部
    pub fn parse_single(header: &str, value: &str) -> Result<HeaderClause> {
        let mut clauses = Self::parse_clauses(header, value)?;
        match clauses.len() {
            1 => Ok(clauses.remove(0)),
            n => Err(invalid(header, format!("应只有一个子句，实际 {}", n))),
        }
    }

    /// 符号名或包名是否合法
    pub fn is_valid_name(name: &str) -> bool {
        NAME_PATTERN.is_match(name)
    }
}

fn invalid(header: &str, reason: impl Into<String>) -> CoreError {
    CoreError::InvalidHeader {
        header: header.to_string(),
        reason: reason.into(),
    }
}

fn checked_key(header: &str, key: &str) -> Result<String> {
    let key = key.trim();
    if key.is_empty() {
        return Err(invalid(header, "参数名为空"));
    }
    Ok(key.to_string())
}

fn unquote(value: &str) -> String {
    let value = value.trim();
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
        .to_string()
}

/// 按分隔符切分，忽略引号内的分隔符
fn split_unquoted(header: &str, input: &str, separator: char) -> Result<Vec<String>> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quoted = false;

    for ch in input.chars() {
        match ch {
            '"' => {
                quoted = !quoted;
                current.push(ch);
            }
            c if c == separator && !quoted => parts.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }

    if quoted {
        return Err(invalid(header, "引号未闭合"));
    }
    parts.push(current);
    Ok(parts)
}
