//! ソース行情報

use crate::{DwarfLoader, DwarfReader, Result};

/// ソース行情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineInfo {
    pub file: String,
    pub line: u32,
    pub column: Option<u32>,
}

impl std::fmt::Display for LineInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// addr2lineによるアドレス -> ソース行の変換
pub struct LineInfoProvider {
    context: Option<addr2line::Context<DwarfReader>>,
}

impl LineInfoProvider {
    /// バイナリのDWARF行情報からプロバイダを作成する
    pub fn new(loader: &DwarfLoader) -> Result<Self> {
        let dwarf = loader.load_dwarf()?;
        let context = addr2line::Context::from_dwarf(dwarf)
            .map_err(|e| anyhow::anyhow!("Failed to build line table context: {}", e))?;
        Ok(Self {
            context: Some(context),
        })
    }

    /// 行情報を持たないプロバイダ
    pub fn empty() -> Self {
        Self { context: None }
    }

    /// ELF上のアドレス（PIEならロードベースを引いた値）からソース行を検索する
    pub fn lookup(&self, addr: u64) -> Result<Option<LineInfo>> {
        let Some(context) = &self.context else {
            return Ok(None);
        };

        let location = context
            .find_location(addr)
            .map_err(|e| anyhow::anyhow!("Failed to look up line for 0x{:x}: {}", addr, e))?;

        Ok(location.and_then(|loc| {
            Some(LineInfo {
                file: loc.file?.to_string(),
                line: loc.line?,
                column: loc.column,
            })
        }))
    }
}

impl Default for LineInfoProvider {
    fn default() -> Self {
        Self::empty()
    }
}
