//! このテストバイナリ自身のDWARFから構造体レイアウトを読むテスト

use fiberscope_dwarf::{DwarfLoader, LayoutError, LineInfoProvider, StructLayouts, SymbolResolver};

#[repr(C)]
pub struct SampleAttr {
    pub flags: u32,
    pub stack_type: u32,
}

#[repr(C)]
pub struct SampleMeta {
    pub tid: u64,
    pub attr: SampleAttr,
    pub stack: u64,
}

fn load_self() -> DwarfLoader {
    let exe = std::env::current_exe().expect("current_exe");
    DwarfLoader::load(exe).expect("Failed to load DWARF from the test binary")
}

#[test]
fn test_layout_of_repr_c_struct() {
    let meta = SampleMeta {
        tid: 1,
        attr: SampleAttr {
            flags: 2,
            stack_type: 3,
        },
        stack: 4,
    };
    std::hint::black_box(&meta);

    let loader = load_self();
    let layouts = StructLayouts::build(loader.dwarf()).expect("Failed to index layouts");
    assert!(!layouts.is_empty());

    let name = "test_layout::SampleMeta";
    assert_eq!(layouts.size_of(name), Ok(24));
    assert_eq!(layouts.field_offset(name, "tid"), Ok(0));
    assert_eq!(layouts.field_offset(name, "attr"), Ok(8));
    assert_eq!(layouts.field_offset(name, "attr.stack_type"), Ok(12));
    assert_eq!(layouts.field_offset(name, "stack"), Ok(16));

    assert!(matches!(
        layouts.field_offset(name, "missing"),
        Err(LayoutError::UnknownField { .. })
    ));
}

#[test]
fn test_symbols_and_lines_load() {
    let loader = load_self();

    let resolver = SymbolResolver::new(&loader).expect("Failed to create symbol resolver");
    assert!(resolver.all_symbols().next().is_some());

    // 行テーブルを構築できること（検索結果の有無はツールチェーン依存）
    let lines = LineInfoProvider::new(&loader).expect("Failed to build line provider");
    let _ = lines.lookup(0).expect("lookup must not fail");
}
