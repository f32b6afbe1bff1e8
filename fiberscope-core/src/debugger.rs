//! アタッチしたプロセスへのアクセス

use crate::Result;
use fiberscope_dwarf::{DwarfLoader, LayoutError, LineInfo, LineInfoProvider, StructLayouts, SymbolResolver};
use fiberscope_fiber::{FiberError, SymbolSpec, TargetAccess};
use fiberscope_target::{Memory, Process, Registers};
use regex::Regex;
use std::fmt;
use std::path::Path;
use tracing::{debug, info, warn};

/// アドレスの説明（最寄りシンボルとソース行）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressInfo {
    pub address: u64,
    /// `symbol+0xoff` 形式
    pub symbol: Option<String>,
    pub line: Option<LineInfo>,
}

impl fmt::Display for AddressInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.address)?;
        if let Some(symbol) = &self.symbol {
            write!(f, " in {}", symbol)?;
        }
        if let Some(line) = &self.line {
            write!(f, " at {}", line)?;
        }
        Ok(())
    }
}

/// デバッガ
///
/// 停止中のプロセスと、その実行ファイルのシンボル・DWARF情報をまとめて持ち、
/// [`TargetAccess`] を実装します。
pub struct Debugger {
    /// デバッグ対象プロセス（ドロップでデタッチ）
    process: Process,
    /// メモリアクセス
    memory: Memory,
    /// レジスタアクセス
    registers: Registers,
    /// DWARF情報ローダー
    dwarf_loader: DwarfLoader,
    /// シンボル解決器
    symbol_resolver: SymbolResolver,
    /// 構造体レイアウト
    layouts: StructLayouts,
    /// ソース行情報
    lines: LineInfoProvider,
    /// PIEのロードベース（非PIEなら0）
    load_bias: u64,
}

impl Debugger {
    /// 実行ファイルを読み込んでから既存のプロセスにアタッチする
    pub fn attach<P: AsRef<Path>>(pid: i32, binary: P) -> Result<Self> {
        let dwarf_loader = DwarfLoader::load(binary.as_ref())?;
        let symbol_resolver = SymbolResolver::new(&dwarf_loader)?;
        let layouts = StructLayouts::build(dwarf_loader.dwarf())?;
        debug!("indexed {} struct layouts", layouts.len());
        if layouts.is_empty() {
            warn!(
                "{:?} has no struct debug info, field offsets cannot be resolved",
                dwarf_loader.path()
            );
        }
        let lines = LineInfoProvider::new(&dwarf_loader).unwrap_or_else(|e| {
            warn!("line info unavailable: {}", e);
            LineInfoProvider::empty()
        });

        let process = Process::attach(pid)?;
        let memory = Memory::new(pid);
        let registers = Registers::new(pid);

        let load_bias = if dwarf_loader.is_pie() {
            memory.load_base(dwarf_loader.path())?
        } else {
            0
        };
        info!(
            "attached to {} ({} threads stopped, load bias 0x{:x})",
            pid,
            process.threads().len(),
            load_bias
        );

        Ok(Self {
            process,
            memory,
            registers,
            dwarf_loader,
            symbol_resolver,
            layouts,
            lines,
            load_bias,
        })
    }

    pub fn pid(&self) -> i32 {
        self.process.pid()
    }

    pub fn binary(&self) -> &Path {
        self.dwarf_loader.path()
    }

    pub fn load_bias(&self) -> u64 {
        self.load_bias
    }

    /// アドレスを最寄りのシンボルとソース行で説明する
    pub fn describe_address(&self, address: u64) -> AddressInfo {
        let file_address = address.wrapping_sub(self.load_bias);

        let symbol = self
            .symbol_resolver
            .reverse_resolve(file_address)
            .map(|sym| match file_address - sym.address {
                0 => sym.display_name().to_string(),
                offset => format!("{}+0x{:x}", sym.display_name(), offset),
            });

        let line = self.lines.lookup(file_address).unwrap_or_else(|e| {
            debug!("{}", e);
            None
        });

        AddressInfo {
            address,
            symbol,
            line,
        }
    }
}

impl TargetAccess for Debugger {
    fn resolve_symbol(&self, symbol: &SymbolSpec) -> Result<u64> {
        let found = symbol
            .candidates
            .iter()
            .find_map(|name| self.symbol_resolver.resolve(name));

        let address = match (found, symbol.pattern) {
            (Some(address), _) => Some(address),
            (None, Some(pattern)) => {
                let regex = Regex::new(pattern)
                    .map_err(|e| anyhow::anyhow!("Invalid symbol pattern '{}': {}", pattern, e))?;
                self.symbol_resolver
                    .resolve_matching(&regex)
                    .map(|sym| sym.address)
            }
            (None, None) => None,
        };

        let address = address.ok_or_else(|| FiberError::SymbolNotFound(symbol.to_string()))?;
        debug!("resolved {} to 0x{:x}", symbol, address + self.load_bias);
        Ok(address + self.load_bias)
    }

    fn field_offset(&self, type_name: &str, path: &str) -> Result<u64> {
        self.layouts
            .field_offset(type_name, path)
            .map_err(|e| layout_error(e, path).into())
    }

    fn type_size(&self, type_name: &str) -> Result<u64> {
        self.layouts
            .size_of(type_name)
            .map_err(|e| layout_error(e, "").into())
    }

    fn read_memory(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        self.memory.read(address, len).map_err(|e| {
            FiberError::MemoryReadFault {
                address,
                reason: e.to_string(),
            }
            .into()
        })
    }

    fn read_register(&self, name: &str) -> Result<u64> {
        self.registers.get(name)
    }

    fn write_register(&mut self, name: &str, value: u64) -> Result<()> {
        self.registers.set(name, value)
    }
}

fn layout_error(err: LayoutError, path: &str) -> FiberError {
    match err {
        LayoutError::UnknownType(type_name) => FiberError::LayoutNotFound {
            type_name,
            field: path.to_string(),
        },
        LayoutError::UnknownField { type_name, field } => {
            FiberError::LayoutNotFound { type_name, field }
        }
    }
}
