//! シンボル解決機能

use crate::{DwarfLoader, Result};
use object::{Object, ObjectSymbol};
use regex::Regex;
use std::collections::HashMap;
use tracing::{debug, warn};

/// シンボル情報
#[derive(Debug, Clone)]
pub struct Symbol {
    /// マングルされたシンボル名
    pub name: String,
    /// デマングルされたシンボル名（デマングルできなければ元の名前）
    pub demangled_name: String,
    pub address: u64,
    pub size: u64,
}

impl Symbol {
    /// シンボルを作成し、デマングルされた名前を設定する
    pub fn new(name: String, address: u64, size: u64) -> Self {
        let demangled_name = demangle_symbol(&name);
        Self {
            name,
            demangled_name,
            address,
            size,
        }
    }

    /// 表示用の名前
    pub fn display_name(&self) -> &str {
        &self.demangled_name
    }
}

/// シンボル名をデマングルする
///
/// 対象はC++なのでまずcpp_demangleで読み、読めなければRustのシンボルとして試す。
/// どちらでも読めなければマングル名のまま残す。
fn demangle_symbol(name: &str) -> String {
    if name.starts_with("_Z") {
        if let Some(demangled) = cpp_demangle::Symbol::new(name)
            .ok()
            .and_then(|sym| sym.demangle(&cpp_demangle::DemangleOptions::default()).ok())
        {
            return demangled;
        }
    }

    if let Ok(demangled) = rustc_demangle::try_demangle(name) {
        return format!("{:#}", demangled);
    }
    name.to_string()
}

/// ELFシンボルテーブルによるシンボル解決
pub struct SymbolResolver {
    /// マングル名・デマングル名 -> symbols_by_address のインデックス
    symbols_by_name: HashMap<String, usize>,
    /// アドレス順にソートしたシンボル
    symbols_by_address: Vec<Symbol>,
}

impl SymbolResolver {
    /// DWARFローダーのオブジェクトファイルからシンボル解決器を作成する
    pub fn new(loader: &DwarfLoader) -> Result<Self> {
        let symbols = loader
            .object_file()
            .symbols()
            .filter(|symbol| !symbol.is_undefined())
            .filter_map(|symbol| {
                let name = symbol.name().ok()?;
                if name.is_empty() {
                    return None;
                }
                Some(Symbol::new(name.to_string(), symbol.address(), symbol.size()))
            })
            .collect();

        let resolver = Self::from_symbols(symbols);
        debug!("loaded {} symbols", resolver.symbols_by_address.len());
        Ok(resolver)
    }

    /// シンボル一覧から解決器を作成する
    pub fn from_symbols(mut symbols: Vec<Symbol>) -> Self {
        symbols.sort_by_key(|s| s.address);

        let mut symbols_by_name = HashMap::new();
        for (idx, sym) in symbols.iter().enumerate() {
            symbols_by_name.entry(sym.name.clone()).or_insert(idx);
            symbols_by_name.entry(sym.demangled_name.clone()).or_insert(idx);
        }

        Self {
            symbols_by_name,
            symbols_by_address: symbols,
        }
    }

    /// シンボル名（マングル名またはデマングル名）からアドレスを解決する
    pub fn resolve(&self, name: &str) -> Option<u64> {
        self.symbols_by_name
            .get(name)
            .map(|&idx| self.symbols_by_address[idx].address)
    }

    /// 正規表現に一致するシンボルを探す
    ///
    /// マングル名とデマングル名の両方を検査します。
    /// 異なるアドレスの候補が複数あれば最初のものを採用し、警告を出します。
    pub fn resolve_matching(&self, pattern: &Regex) -> Option<Symbol> {
        let mut candidates = self
            .symbols_by_address
            .iter()
            .filter(|s| pattern.is_match(&s.name) || pattern.is_match(&s.demangled_name));

        let first = candidates.next()?;
        let others = candidates.filter(|s| s.address != first.address).count();
        if others > 0 {
            warn!(
                "pattern '{}' matched {} other symbols, using {}",
                pattern,
                others,
                first.display_name()
            );
        }
        Some(first.clone())
    }

    /// アドレスを含む（または直前の）シンボルを探す
    pub fn reverse_resolve(&self, addr: u64) -> Option<&Symbol> {
        let idx = match self
            .symbols_by_address
            .binary_search_by_key(&addr, |s| s.address)
        {
            Ok(idx) => return self.symbols_by_address.get(idx),
            Err(0) => return None,
            Err(idx) => idx - 1,
        };

        let sym = &self.symbols_by_address[idx];
        if sym.size == 0 || addr < sym.address + sym.size {
            Some(sym)
        } else {
            None
        }
    }

    /// すべてのシンボルを取得する
    pub fn all_symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols_by_address.iter()
    }
}
