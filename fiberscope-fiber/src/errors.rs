//! オペレータに報告するエラー

/// ファイバー調査で起こるエラー
///
/// どれも回復可能で、コマンドを中断して診断メッセージとして表示されます。
/// `anyhow::Error` に包んで伝播し、必要なら `downcast_ref` で種別を調べます。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FiberError {
    #[error("Not in fiber debug mode")]
    NotActive,

    #[error("Already in fiber debug mode, do not switch thread before 'end'")]
    AlreadyActive,

    #[error("id {index} exceeds max fiber nums {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("fiber #{index} has no stack")]
    NoStack { index: usize },

    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("Failed to read target memory at 0x{address:x}: {reason}")]
    MemoryReadFault { address: u64, reason: String },

    /// `field` が空なら型そのものが見つからない
    #[error("Type layout not found: {type_name}{}", field_suffix(.field))]
    LayoutNotFound { type_name: String, field: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

fn field_suffix(field: &str) -> String {
    if field.is_empty() {
        String::new()
    } else {
        format!(" (field '{}')", field)
    }
}

/// anyhow::Error がこの種別のFiberErrorかどうか
pub fn is_fiber_error(err: &anyhow::Error, pred: impl FnOnce(&FiberError) -> bool) -> bool {
    err.downcast_ref::<FiberError>().is_some_and(pred)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        assert_eq!(
            FiberError::IndexOutOfRange { index: 3, len: 3 }.to_string(),
            "id 3 exceeds max fiber nums 3"
        );
        assert_eq!(
            FiberError::MemoryReadFault {
                address: 0x10,
                reason: "EIO".to_string()
            }
            .to_string(),
            "Failed to read target memory at 0x10: EIO"
        );
        assert_eq!(
            FiberError::LayoutNotFound {
                type_name: "fiber::TaskMeta".to_string(),
                field: "tid".to_string()
            }
            .to_string(),
            "Type layout not found: fiber::TaskMeta (field 'tid')"
        );
    }

    #[test]
    fn test_is_fiber_error() {
        let err: anyhow::Error = FiberError::NoStack { index: 1 }.into();
        assert!(is_fiber_error(&err, |e| matches!(e, FiberError::NoStack { .. })));
        assert!(!is_fiber_error(&err, |e| *e == FiberError::NotActive));
        assert!(!is_fiber_error(&anyhow::anyhow!("other"), |_| true));
    }
}
