//! LDAP 风格服务过滤器
//!
//! 支持的语法：
//!
//! ```text
//! filter     = "(" filtercomp ")"
//! filtercomp = and | or | not | item
//! and        = "&" filter+
//! or         = "|" filter+
//! not        = "!" filter
//! item       = attr op value
//! op         = "=" | "~=" | ">=" | "<="
//! value      = "*" 表示存在性判断；含 "*" 时为子串匹配
//! ```
//!
//! 值中的 `(`、`)`、`*`、`\` 需使用 `\` 转义。比较时若两侧都能解析为
//! 整数则按数值比较，否则按字符串比较；属性名忽略大小写。

use std::fmt;

use crate::utils::{FrameworkError, Properties, Result};

/// 比较运算符
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    /// `=`
    Equal,
    /// `~=`，忽略大小写与空白
    Approx,
    /// `>=`
    GreaterOrEqual,
    /// `<=`
    LessOrEqual,
}

/// 已解析的过滤器
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// 所有子过滤器都匹配
    And(Vec<Filter>),
    /// 任一子过滤器匹配
    Or(Vec<Filter>),
    /// 取反
    Not(Box<Filter>),
    /// 属性存在
    Present(String),
    /// 子串匹配，`parts` 为被 `*` 分隔的片段（首尾可为空）
    Substring { attr: String, parts: Vec<String> },
    /// 简单比较
    Compare {
        attr: String,
        op: Comparison,
        value: String,
    },
}

impl Filter {
    /// 解析过滤器表达式
    ///
    /// # Errors
    ///
    /// 表达式格式错误时返回 `IllegalArgument`
    pub fn parse(input: &str) -> Result<Filter> {
        let mut parser = Parser::new(input.trim());
        let filter = parser.filter()?;
        if !parser.is_end() {
            return Err(parser.error("过滤器末尾存在多余字符"));
        }
        Ok(filter)
    }

    /// 判断属性表是否匹配该过滤器
    pub fn matches(&self, props: &Properties) -> bool {
        match self {
            Filter::And(children) => children.iter().all(|f| f.matches(props)),
            Filter::Or(children) => children.iter().any(|f| f.matches(props)),
            Filter::Not(inner) => !inner.matches(props),
            Filter::Present(attr) => props.get_ignore_case(attr).is_some(),
            Filter::Substring { attr, parts } => props
                .get_ignore_case(attr)
                .map(|v| substring_matches(v, parts))
                .unwrap_or(false),
            Filter::Compare { attr, op, value } => props
                .get_ignore_case(attr)
                .map(|actual| compare(actual, *op, value))
                .unwrap_or(false),
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::And(children) => {
                f.write_str("(&")?;
                for child in children {
                    write!(f, "{}", child)?;
                }
                f.write_str(")")
            }
            Filter::Or(children) => {
                f.write_str("(|")?;
                for child in children {
                    write!(f, "{}", child)?;
                }
                f.write_str(")")
            }
            Filter::Not(inner) => write!(f, "(!{})", inner),
            Filter::Present(attr) => write!(f, "({}=*)", attr),
            Filter::Substring { attr, parts } => {
                let escaped: Vec<String> = parts.iter().map(|p| escape_value(p)).collect();
                write!(f, "({}={})", attr, escaped.join("*"))
            }
            Filter::Compare { attr, op, value } => {
                let op = match op {
                    Comparison::Equal => "=",
                    Comparison::Approx => "~=",
                    Comparison::GreaterOrEqual => ">=",
                    Comparison::LessOrEqual => "<=",
                };
                write!(f, "({}{}{})", attr, op, escape_value(value))
            }
        }
    }
}

impl std::str::FromStr for Filter {
    type Err = FrameworkError;

    fn from_str(s: &str) -> Result<Self> {
        Filter::parse(s)
    }
}

/// 转义过滤器值中的特殊字符
pub fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '(' | ')' | '*' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn compare(actual: &str, op: Comparison, expected: &str) -> bool {
    let numeric = actual
        .trim()
        .parse::<i64>()
        .ok()
        .zip(expected.trim().parse::<i64>().ok());

    match op {
        Comparison::Equal => match numeric {
            Some((a, e)) => a == e,
            None => actual == expected,
        },
        Comparison::Approx => normalize(actual) == normalize(expected),
        Comparison::GreaterOrEqual => match numeric {
            Some((a, e)) => a >= e,
            None => actual >= expected,
        },
        Comparison::LessOrEqual => match numeric {
            Some((a, e)) => a <= e,
            None => actual <= expected,
        },
    }
}

fn normalize(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

fn substring_matches(value: &str, parts: &[String]) -> bool {
    let Some((first, rest)) = parts.split_first() else {
        return true;
    };
    let Some(remaining) = value.strip_prefix(first.as_str()) else {
        return false;
    };
    let Some((last, middle)) = rest.split_last() else {
        return remaining.is_empty();
    };

    let mut cursor = remaining;
    for part in middle {
        match cursor.find(part.as_str()) {
            Some(pos) => cursor = &cursor[pos + part.len()..],
            None => return false,
        }
    }
    cursor.len() >= last.len() && cursor.ends_with(last.as_str())
}

/// 递归下降解析器状态
struct Parser<'a> {
    input: &'a str,
    position: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, position: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.position..].chars().next()
    }

    fn next(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.position += ch.len_utf8();
        Some(ch)
    }

    fn is_end(&self) -> bool {
        self.position >= self.input.len()
    }

    fn skip_whitespace(&mut self) {
        while self.peek().map(char::is_whitespace).unwrap_or(false) {
            self.next();
        }
    }

    fn error(&self, message: &str) -> FrameworkError {
        FrameworkError::IllegalArgument(format!(
            "无效的过滤器 '{}'（位置 {}）: {}",
            self.input, self.position, message
        ))
    }

    fn take(&mut self, expected: char) -> Result<()> {
        match self.next() {
            Some(ch) if ch == expected => Ok(()),
            Some(ch) => Err(self.error(&format!("期望 '{}'，实际为 '{}'", expected, ch))),
            None => Err(self.error(&format!("期望 '{}'，但已到达末尾", expected))),
        }
    }

    fn filter(&mut self) -> Result<Filter> {
        self.skip_whitespace();
        self.take('(')?;
        self.skip_whitespace();
        let filter = match self.peek() {
            Some('&') => {
                self.next();
                Filter::And(self.filter_list()?)
            }
            Some('|') => {
                self.next();
                Filter::Or(self.filter_list()?)
            }
            Some('!') => {
                self.next();
                Filter::Not(Box::new(self.filter()?))
            }
            Some(_) => self.item()?,
            None => return Err(self.error("过滤器不完整")),
        };
        self.skip_whitespace();
        self.take(')')?;
        Ok(filter)
    }

    fn filter_list(&mut self) -> Result<Vec<Filter>> {
        let mut children = Vec::new();
        loop {
            self.skip_whitespace();
            if self.peek() != Some('(') {
                break;
            }
            children.push(self.filter()?);
        }
        if children.is_empty() {
            return Err(self.error("组合过滤器至少需要一个子过滤器"));
        }
        Ok(children)
    }

    fn item(&mut self) -> Result<Filter> {
        let start = self.position;
        while let Some(ch) = self.peek() {
            if matches!(ch, '=' | '~' | '>' | '<' | '(' | ')') {
                break;
            }
            self.next();
        }
        let attr = self.input[start..self.position].trim().to_string();
        if attr.is_empty() {
            return Err(self.error("缺少属性名"));
        }

        let op = match self.next() {
            Some('=') => Comparison::Equal,
            Some('~') => {
                self.take('=')?;
                Comparison::Approx
            }
            Some('>') => {
                self.take('=')?;
                Comparison::GreaterOrEqual
            }
            Some('<') => {
                self.take('=')?;
                Comparison::LessOrEqual
            }
            _ => return Err(self.error("缺少比较运算符")),
        };

        let (parts, has_wildcard) = self.value()?;
        if op != Comparison::Equal {
            if has_wildcard {
                return Err(self.error("只有 '=' 支持通配符"));
            }
            return Ok(Filter::Compare {
                attr,
                op,
                value: parts.concat(),
            });
        }

        if !has_wildcard {
            return Ok(Filter::Compare {
                attr,
                op,
                value: parts.concat(),
            });
        }
        if parts.len() == 2 && parts.iter().all(String::is_empty) {
            return Ok(Filter::Present(attr));
        }
        Ok(Filter::Substring { attr, parts })
    }

    /// 解析值，返回按未转义 `*` 切分的片段
    fn value(&mut self) -> Result<(Vec<String>, bool)> {
        let mut parts = vec![String::new()];
        let mut has_wildcard = false;
        loop {
            match self.peek() {
                Some(')') | None => break,
                Some('(') => return Err(self.error("值中的 '(' 需要转义")),
                Some('*') => {
                    self.next();
                    has_wildcard = true;
                    parts.push(String::new());
                }
                Some('\\') => {
                    self.next();
                    let escaped = self
                        .next()
                        .ok_or_else(|| self.error("转义字符后缺少内容"))?;
                    if let Some(last) = parts.last_mut() {
                        last.push(escaped);
                    }
                }
                Some(ch) => {
                    self.next();
                    if let Some(last) = parts.last_mut() {
                        last.push(ch);
                    }
                }
            }
        }
        Ok((parts, has_wildcard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props() -> Properties {
        Properties::new()
            .with("objectClass", "org.chips.Logger")
            .with("service.ranking", "10")
            .with("vendor", "Chips Team")
            .with("path", "a(b)*c")
    }

    #[test]
    fn test_simple_equality() {
        let filter = Filter::parse("(vendor=Chips Team)").unwrap();
        assert!(filter.matches(&props()));
        assert!(!Filter::parse("(vendor=other)").unwrap().matches(&props()));
    }

    #[test]
    fn test_attribute_name_is_case_insensitive() {
        let filter = Filter::parse("(OBJECTCLASS=org.chips.Logger)").unwrap();
        assert!(filter.matches(&props()));
    }

    #[test]
    fn test_composite_filters() {
        let filter =
            Filter::parse("(&(objectClass=org.chips.Logger)(|(vendor=x)(service.ranking>=5)))")
                .unwrap();
        assert!(filter.matches(&props()));

        let filter = Filter::parse("(!(vendor=Chips Team))").unwrap();
        assert!(!filter.matches(&props()));
    }

    #[test]
    fn test_numeric_comparison() {
        assert!(Filter::parse("(service.ranking>=9)").unwrap().matches(&props()));
        assert!(!Filter::parse("(service.ranking<=9)").unwrap().matches(&props()));
        // 两侧均为整数时按数值相等
        assert!(Filter::parse("(service.ranking=010)").unwrap().matches(&props()));
    }

    #[test]
    fn test_presence_and_substring() {
        assert!(Filter::parse("(vendor=*)").unwrap().matches(&props()));
        assert!(!Filter::parse("(missing=*)").unwrap().matches(&props()));
        assert!(Filter::parse("(objectClass=org.*.Logger)").unwrap().matches(&props()));
        assert!(Filter::parse("(objectClass=*Logger)").unwrap().matches(&props()));
        assert!(!Filter::parse("(objectClass=*Logger*x)").unwrap().matches(&props()));
    }

    #[test]
    fn test_escaped_value() {
        let filter = Filter::parse(r"(path=a\(b\)\*c)").unwrap();
        assert!(filter.matches(&props()));
        assert_eq!(filter.to_string(), r"(path=a\(b\)\*c)");
    }

    #[test]
    fn test_approx_match() {
        assert!(Filter::parse("(vendor~=chipsteam)").unwrap().matches(&props()));
    }

    #[test]
    fn test_malformed_filters_rejected() {
        for bad in ["", "vendor=x", "(vendor=x", "(=x)", "(&)", "(vendor>x)", "(a=b))", "(a>=b*)"] {
            let err = Filter::parse(bad).unwrap_err();
            assert!(
                matches!(err, FrameworkError::IllegalArgument(_)),
                "expected IllegalArgument for {:?}",
                bad
            );
        }
    }
}
