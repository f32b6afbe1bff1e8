//! ELFとDWARFの読み込み機能

use crate::Result;
use object::{Object, ObjectSection};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// このクレートで扱うDWARFリーダー
pub type DwarfReader = gimli::EndianSlice<'static, gimli::RunTimeEndian>;

/// ELFバイナリとそのDWARFセクション
pub struct DwarfLoader {
    path: PathBuf,
    object_file: object::File<'static>,
    endian: gimli::RunTimeEndian,
    dwarf: gimli::Dwarf<DwarfReader>,
}

impl DwarfLoader {
    /// ELFファイルからDWARF情報を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file_data = fs::read(path)
            .map_err(|e| anyhow::anyhow!("Failed to read file {:?}: {}", path, e))?;

        // セッション中はずっと参照するので'staticに昇格させる
        let file_data: &'static [u8] = Box::leak(file_data.into_boxed_slice());

        let object_file = object::File::parse(file_data)
            .map_err(|e| anyhow::anyhow!("Failed to parse ELF file {:?}: {}", path, e))?;

        let endian = if object_file.is_little_endian() {
            gimli::RunTimeEndian::Little
        } else {
            gimli::RunTimeEndian::Big
        };

        let dwarf = load_sections(&object_file, endian)?;
        debug!("loaded DWARF sections from {:?}", path);

        Ok(Self {
            path: path.to_path_buf(),
            object_file,
            endian,
            dwarf,
        })
    }

    /// 読み込んだバイナリのパス
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// DWARFコンテキストへの参照を取得
    pub fn dwarf(&self) -> &gimli::Dwarf<DwarfReader> {
        &self.dwarf
    }

    /// DWARFセクションを読み直して所有権付きで返す
    ///
    /// addr2lineのコンテキストはDwarfの所有権を要求するため。
    pub fn load_dwarf(&self) -> Result<gimli::Dwarf<DwarfReader>> {
        load_sections(&self.object_file, self.endian)
    }

    /// オブジェクトファイルへの参照を取得
    pub fn object_file(&self) -> &object::File<'static> {
        &self.object_file
    }

    /// PIE（Position Independent Executable）かどうかを判定する
    ///
    /// ET_DYN ではシンボルアドレスがロードベースからのオフセットになり、
    /// 実行時のベースアドレスを加算する必要があります。
    pub fn is_pie(&self) -> bool {
        matches!(self.object_file.kind(), object::ObjectKind::Dynamic)
    }
}

fn load_sections(
    object_file: &object::File<'static>,
    endian: gimli::RunTimeEndian,
) -> Result<gimli::Dwarf<DwarfReader>> {
    let load_section = |id: gimli::SectionId| -> Result<DwarfReader> {
        let data = object_file
            .section_by_name(id.name())
            .and_then(|section| section.data().ok())
            .unwrap_or(&[]);
        Ok(gimli::EndianSlice::new(data, endian))
    };

    gimli::Dwarf::load(load_section)
        .map_err(|e| anyhow::anyhow!("Failed to load DWARF sections: {}", e))
}
