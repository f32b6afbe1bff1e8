//! パース関連のユーティリティ関数

use crate::Result;
use fiberscope_fiber::FiberError;

/// 符号なし整数をパース
///
/// 16進数（0xプレフィックス付き）または10進数をサポート。
/// 負の値や数値でない文字列は `FiberError::InvalidArgument` になります。
///
/// # Examples
/// ```
/// use fiberscope_core::parse::parse_unsigned;
///
/// assert_eq!(parse_unsigned("0x10", "count").unwrap(), 16);
/// assert_eq!(parse_unsigned("42", "count").unwrap(), 42);
/// ```
pub fn parse_unsigned(s: &str, what: &str) -> Result<u64> {
    let s = s.trim();

    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        s.parse::<u64>()
    };

    parsed.map_err(|e| FiberError::InvalidArgument(format!("{} '{}': {}", what, s, e)).into())
}

/// テーブルのインデックスをパース
pub fn parse_index(s: &str) -> Result<usize> {
    let value = parse_unsigned(s, "index")?;
    usize::try_from(value)
        .map_err(|_| FiberError::InvalidArgument(format!("index '{}' is too large", s)).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_invalid(result: Result<u64>) -> bool {
        matches!(
            result.unwrap_err().downcast_ref::<FiberError>(),
            Some(FiberError::InvalidArgument(_))
        )
    }

    #[test]
    fn test_parse_hex_and_dec() {
        assert_eq!(parse_unsigned("0x1f", "count").unwrap(), 0x1f);
        assert_eq!(parse_unsigned("0X1F", "count").unwrap(), 0x1f);
        assert_eq!(parse_unsigned(" 12 ", "count").unwrap(), 12);
    }

    #[test]
    fn test_rejects_negative_and_garbage() {
        assert!(is_invalid(parse_unsigned("-1", "count")));
        assert!(is_invalid(parse_unsigned("abc", "count")));
        assert!(is_invalid(parse_unsigned("0xzz", "count")));
        assert!(is_invalid(parse_unsigned("", "count")));
    }

    #[test]
    fn test_parse_index() {
        assert_eq!(parse_index("3").unwrap(), 3);
        assert!(parse_index("-3").is_err());
    }
}
