//! fiberscope DWARF デバッグ情報解析
//!
//! このクレートは、対象バイナリのELFシンボルとDWARFデバッグ情報を扱います。
//! シンボル名の解決、構造体フィールドのオフセット解決、アドレスからソース行への変換を行います。

pub mod loader;
pub mod symbols;
pub mod layout;
pub mod lines;

pub use loader::{DwarfLoader, DwarfReader};
pub use symbols::{Symbol, SymbolResolver};
pub use layout::{FieldLayout, LayoutError, StructLayout, StructLayouts};
pub use lines::{LineInfo, LineInfoProvider};

/// DWARF解析の結果型
pub type Result<T> = anyhow::Result<T>;
