//! DWARFから構造体レイアウトを抽出する
//!
//! 対象プロセスの構造体（制御ブロック、プール、カウンタのノードなど）を
//! 型名とドット区切りのフィールドパスでたどるために、全コンパイルユニットの
//! 構造体定義を「修飾名 -> フィールドオフセット一覧」に索引化します。

use crate::Result;
use gimli::Reader;
use std::collections::HashMap;
use tracing::debug;

/// エイリアス（typedef/const/volatile/atomic）をたどる上限
const MAX_ALIAS_HOPS: usize = 8;

/// 基底クラスや無名メンバを探索する深さの上限
const MAX_NESTING: usize = 8;

/// レイアウト解決のエラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    #[error("type '{0}' not found in debug info")]
    UnknownType(String),
    #[error("field '{field}' not found in type '{type_name}'")]
    UnknownField { type_name: String, field: String },
}

/// 構造体のフィールド
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldLayout {
    /// フィールド名（無名union/structや基底クラスではNone）
    pub name: Option<String>,
    /// 構造体先頭からのオフセット（バイト）
    pub offset: u64,
    /// フィールドの型が構造体の場合、その修飾名
    pub type_name: Option<String>,
    /// 基底クラス（DW_TAG_inheritance）かどうか
    pub inherited: bool,
}

/// 構造体のレイアウト
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructLayout {
    /// 修飾名（例: `fiber::TaskMeta`）
    pub name: String,
    pub size: u64,
    pub fields: Vec<FieldLayout>,
}

/// 修飾名で引ける構造体レイアウトの索引
#[derive(Debug, Default)]
pub struct StructLayouts {
    structs: HashMap<String, StructLayout>,
}

impl StructLayouts {
    /// 全コンパイルユニットを走査して索引を作る
    pub fn build<R: Reader<Offset = usize>>(dwarf: &gimli::Dwarf<R>) -> Result<Self> {
        let mut layouts = Self::default();
        let mut units = dwarf.units();
        while let Some(header) = units.next()? {
            let unit = dwarf.unit(header)?;
            for layout in UnitScanner::new(dwarf, &unit).scan()? {
                layouts.insert(layout);
            }
        }
        debug!("indexed {} struct layouts", layouts.structs.len());
        Ok(layouts)
    }

    /// レイアウト一覧から索引を作る
    pub fn from_layouts(layouts: impl IntoIterator<Item = StructLayout>) -> Self {
        let mut index = Self::default();
        for layout in layouts {
            index.insert(layout);
        }
        index
    }

    /// 最初に見つかった定義を優先する
    fn insert(&mut self, layout: StructLayout) {
        self.structs.entry(normalize(&layout.name)).or_insert(layout);
    }

    /// 索引化された構造体の数
    pub fn len(&self) -> usize {
        self.structs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.structs.is_empty()
    }

    /// 型名から構造体を取得する（空白の違いは無視する）
    pub fn get(&self, type_name: &str) -> Option<&StructLayout> {
        self.structs.get(&normalize(type_name))
    }

    /// 構造体のサイズ
    pub fn size_of(&self, type_name: &str) -> std::result::Result<u64, LayoutError> {
        self.get(type_name)
            .map(|s| s.size)
            .ok_or_else(|| LayoutError::UnknownType(type_name.to_string()))
    }

    /// ドット区切りのフィールドパスのオフセットを求める
    ///
    /// 例: `field_offset("fiber::TaskMeta", "attr.stack_type")`
    /// 各段でフィールドが見つからなければ基底クラスと無名メンバの中も探します。
    pub fn field_offset(&self, type_name: &str, path: &str) -> std::result::Result<u64, LayoutError> {
        let mut current = self
            .get(type_name)
            .ok_or_else(|| LayoutError::UnknownType(type_name.to_string()))?;
        let mut total = 0;

        let segments: Vec<&str> = path.split('.').collect();
        for (i, segment) in segments.iter().enumerate() {
            let unknown = |layout: &StructLayout| LayoutError::UnknownField {
                type_name: layout.name.clone(),
                field: segment.to_string(),
            };
            let (offset, field_type) = self
                .find_field(current, segment, 0)
                .ok_or_else(|| unknown(current))?;
            total += offset;

            if i + 1 < segments.len() {
                current = match field_type.and_then(|name| self.get(&name)) {
                    Some(next) => next,
                    None => return Err(unknown(current)),
                };
            }
        }
        Ok(total)
    }

    fn find_field(
        &self,
        layout: &StructLayout,
        name: &str,
        depth: usize,
    ) -> Option<(u64, Option<String>)> {
        if let Some(field) = layout.fields.iter().find(|f| f.name.as_deref() == Some(name)) {
            return Some((field.offset, field.type_name.clone()));
        }
        if depth >= MAX_NESTING {
            return None;
        }

        // 基底クラスと無名union/structの中を探す
        layout
            .fields
            .iter()
            .filter(|f| f.inherited || f.name.is_none())
            .find_map(|f| {
                let nested = self.get(f.type_name.as_deref()?)?;
                let (offset, ty) = self.find_field(nested, name, depth + 1)?;
                Some((f.offset + offset, ty))
            })
    }
}

/// 組み込み型の綴りに現れるキーワード
const BUILTIN_WORDS: &[&str] = &["signed", "unsigned", "short", "long", "int", "char"];

/// 索引のキー
///
/// 空白は識別子どうしの区切りにだけ残すので `> >` と `>>` は同一になります。
/// GCCはテンプレート引数を `long int` や `long unsigned int` と書くため、
/// 組み込み型の綴りは `unsigned long` のような正規形にそろえます。
fn normalize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut builtin: Vec<&str> = Vec::new();
    let mut last_is_word = false;

    for token in tokenize(name) {
        if BUILTIN_WORDS.contains(&token) {
            builtin.push(token);
            continue;
        }
        if !builtin.is_empty() {
            push_word(&mut out, &mut last_is_word, &canonical_builtin(&builtin));
            builtin.clear();
        }
        if is_word(token) {
            push_word(&mut out, &mut last_is_word, token);
        } else {
            out.push_str(token);
            last_is_word = false;
        }
    }
    if !builtin.is_empty() {
        push_word(&mut out, &mut last_is_word, &canonical_builtin(&builtin));
    }
    out
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn is_word(token: &str) -> bool {
    token.chars().next().is_some_and(is_word_char)
}

fn push_word(out: &mut String, last_is_word: &mut bool, word: &str) {
    if *last_is_word {
        out.push(' ');
    }
    out.push_str(word);
    *last_is_word = true;
}

/// 識別子のまとまりと記号1文字ずつに分割する（空白は捨てる）
fn tokenize(name: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut start = None;
    for (i, c) in name.char_indices() {
        if is_word_char(c) {
            start.get_or_insert(i);
            continue;
        }
        if let Some(s) = start.take() {
            tokens.push(&name[s..i]);
        }
        if !c.is_whitespace() {
            tokens.push(&name[i..i + c.len_utf8()]);
        }
    }
    if let Some(s) = start {
        tokens.push(&name[s..]);
    }
    tokens
}

/// `long unsigned int` -> `unsigned long`、`short int` -> `short` など
fn canonical_builtin(words: &[&str]) -> String {
    let has = |w: &str| words.contains(&w);
    let longs = words.iter().filter(|&&w| w == "long").count();

    let mut parts = Vec::new();
    if has("char") {
        // char / signed char / unsigned char は別の型
        if has("unsigned") {
            parts.push("unsigned");
        } else if has("signed") {
            parts.push("signed");
        }
        parts.push("char");
        return parts.join(" ");
    }

    if has("unsigned") {
        parts.push("unsigned");
    }
    if has("short") {
        parts.push("short");
    }
    parts.extend(std::iter::repeat("long").take(longs));
    if !has("short") && longs == 0 {
        parts.push("int");
    }
    parts.join(" ")
}

/// 走査中のスコープ
enum Scope {
    /// 名前空間または構造体の名前
    Named(String),
    /// 走査中の構造体（pending のインデックス）
    Struct(usize),
    /// 関数内など、名前の修飾に使わないスコープ
    Other,
}

/// DIEオフセットから見た型
enum TypeNode {
    Struct(String),
    Alias(gimli::UnitOffset<usize>),
}

struct PendingMember {
    name: Option<String>,
    offset: u64,
    type_ref: Option<gimli::UnitOffset<usize>>,
    inherited: bool,
}

struct PendingStruct {
    name: String,
    size: Option<u64>,
    declaration: bool,
    members: Vec<PendingMember>,
}

/// 1つのコンパイルユニットを走査する
struct UnitScanner<'a, R: Reader<Offset = usize>> {
    dwarf: &'a gimli::Dwarf<R>,
    unit: &'a gimli::Unit<R>,
    pending: Vec<PendingStruct>,
    types: HashMap<gimli::UnitOffset<usize>, TypeNode>,
}

impl<'a, R: Reader<Offset = usize>> UnitScanner<'a, R> {
    fn new(dwarf: &'a gimli::Dwarf<R>, unit: &'a gimli::Unit<R>) -> Self {
        Self {
            dwarf,
            unit,
            pending: Vec::new(),
            types: HashMap::new(),
        }
    }

    fn scan(mut self) -> Result<Vec<StructLayout>> {
        let mut scopes: Vec<(isize, Scope)> = Vec::new();
        let mut depth: isize = 0;
        let unit = self.unit;
        let mut entries = unit.entries();

        while let Some((delta, entry)) = entries.next_dfs()? {
            depth += delta;
            while scopes.last().is_some_and(|(d, _)| *d >= depth) {
                scopes.pop();
            }

            match entry.tag() {
                gimli::DW_TAG_namespace => {
                    let name = self
                        .name(entry)?
                        .unwrap_or_else(|| "(anonymous namespace)".to_string());
                    scopes.push((depth, Scope::Named(name)));
                }
                gimli::DW_TAG_structure_type | gimli::DW_TAG_class_type | gimli::DW_TAG_union_type => {
                    let Some(name) = self.name(entry)? else {
                        // 無名の型はオフセットで参照されるだけなので仮の名前で登録する
                        let global = entry
                            .offset()
                            .to_debug_info_offset(&unit.header)
                            .map(|o| o.0)
                            .unwrap_or(entry.offset().0);
                        let name = format!("<anonymous@{:#x}>", global);
                        self.begin_struct(entry, name, &mut scopes, depth)?;
                        continue;
                    };
                    let qualified = qualify(&scopes, &self.pending, &name);
                    self.begin_struct(entry, qualified, &mut scopes, depth)?;
                }
                gimli::DW_TAG_member | gimli::DW_TAG_inheritance => {
                    let parent = match scopes.last() {
                        Some((d, Scope::Struct(idx))) if *d == depth - 1 => *idx,
                        _ => continue,
                    };
                    // 静的メンバはオフセットを持たない
                    let Some(offset) = self.member_offset(entry)? else {
                        continue;
                    };
                    let member = PendingMember {
                        name: self.name(entry)?,
                        offset,
                        type_ref: type_ref(entry)?,
                        inherited: entry.tag() == gimli::DW_TAG_inheritance,
                    };
                    self.pending[parent].members.push(member);
                }
                gimli::DW_TAG_typedef
                | gimli::DW_TAG_const_type
                | gimli::DW_TAG_volatile_type
                | gimli::DW_TAG_atomic_type => {
                    if let Some(target) = type_ref(entry)? {
                        self.types.insert(entry.offset(), TypeNode::Alias(target));
                    }
                }
                gimli::DW_TAG_subprogram | gimli::DW_TAG_lexical_block => {
                    scopes.push((depth, Scope::Other));
                }
                _ => {}
            }
        }

        Ok(self.finish())
    }

    fn begin_struct(
        &mut self,
        entry: &gimli::DebuggingInformationEntry<R>,
        qualified: String,
        scopes: &mut Vec<(isize, Scope)>,
        depth: isize,
    ) -> Result<()> {
        let declaration = matches!(
            entry.attr_value(gimli::DW_AT_declaration)?,
            Some(gimli::AttributeValue::Flag(true))
        );
        let size = match entry.attr_value(gimli::DW_AT_byte_size)? {
            Some(gimli::AttributeValue::Udata(size)) => Some(size),
            _ => None,
        };

        self.types
            .insert(entry.offset(), TypeNode::Struct(qualified.clone()));
        self.pending.push(PendingStruct {
            name: qualified,
            size,
            declaration,
            members: Vec::new(),
        });
        scopes.push((depth, Scope::Struct(self.pending.len() - 1)));
        Ok(())
    }

    fn name(&self, entry: &gimli::DebuggingInformationEntry<R>) -> Result<Option<String>> {
        let Some(attr) = entry.attr_value(gimli::DW_AT_name)? else {
            return Ok(None);
        };
        let raw = self.dwarf.attr_string(self.unit, attr)?;
        Ok(Some(raw.to_string_lossy()?.into_owned()))
    }

    fn member_offset(&self, entry: &gimli::DebuggingInformationEntry<R>) -> Result<Option<u64>> {
        let value = match entry.attr_value(gimli::DW_AT_data_member_location)? {
            Some(value) => value,
            // unionのメンバは位置属性を省略することがある
            None if entry.attr_value(gimli::DW_AT_external)?.is_none() => return Ok(Some(0)),
            None => return Ok(None),
        };

        match value {
            gimli::AttributeValue::Udata(offset) => Ok(Some(offset)),
            gimli::AttributeValue::Sdata(offset) if offset >= 0 => Ok(Some(offset as u64)),
            gimli::AttributeValue::Exprloc(expr) => {
                let mut ops = expr.operations(self.unit.encoding());
                while let Some(op) = ops.next()? {
                    if let gimli::Operation::PlusConstant { value } = op {
                        return Ok(Some(value));
                    }
                }
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    /// メンバの型参照を、エイリアスを剥がした構造体名に解決する
    fn struct_name(&self, mut offset: gimli::UnitOffset<usize>) -> Option<String> {
        for _ in 0..MAX_ALIAS_HOPS {
            match self.types.get(&offset)? {
                TypeNode::Struct(name) => return Some(name.clone()),
                TypeNode::Alias(target) => offset = *target,
            }
        }
        None
    }

    fn finish(self) -> Vec<StructLayout> {
        self.pending
            .iter()
            .filter(|s| !s.declaration)
            .filter_map(|s| {
                let size = s.size?;
                let fields = s
                    .members
                    .iter()
                    .map(|m| FieldLayout {
                        name: m.name.clone(),
                        offset: m.offset,
                        type_name: m.type_ref.and_then(|t| self.struct_name(t)),
                        inherited: m.inherited,
                    })
                    .collect();
                Some(StructLayout {
                    name: s.name.clone(),
                    size,
                    fields,
                })
            })
            .collect()
    }
}

fn type_ref<R: Reader<Offset = usize>>(
    entry: &gimli::DebuggingInformationEntry<R>,
) -> Result<Option<gimli::UnitOffset<usize>>> {
    match entry.attr_value(gimli::DW_AT_type)? {
        Some(gimli::AttributeValue::UnitRef(offset)) => Ok(Some(offset)),
        _ => Ok(None),
    }
}

/// 外側のスコープ名で修飾する
fn qualify(scopes: &[(isize, Scope)], pending: &[PendingStruct], name: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for (_, scope) in scopes {
        match scope {
            Scope::Named(n) => parts.push(n),
            // 構造体の修飾名はすでに外側の名前を含む
            Scope::Struct(idx) => {
                parts.clear();
                parts.push(&pending[*idx].name);
            }
            Scope::Other => parts.clear(),
        }
    }
    parts.push(name);
    parts.join("::")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: Option<&str>, offset: u64, type_name: Option<&str>, inherited: bool) -> FieldLayout {
        FieldLayout {
            name: name.map(str::to_string),
            offset,
            type_name: type_name.map(str::to_string),
            inherited,
        }
    }

    fn layouts() -> StructLayouts {
        StructLayouts::from_layouts(vec![
            StructLayout {
                name: "fiber::TaskMeta".to_string(),
                size: 0x80,
                fields: vec![
                    field(Some("tid"), 0x08, None, false),
                    field(Some("attr"), 0x20, Some("fiber::FiberAttr"), false),
                ],
            },
            StructLayout {
                name: "fiber::FiberAttr".to_string(),
                size: 0x18,
                fields: vec![field(Some("stack_type"), 0x04, None, false)],
            },
            StructLayout {
                name: "Agent<long, long>".to_string(),
                size: 0x30,
                fields: vec![
                    field(None, 0x00, Some("LinkNode<Agent>"), true),
                    field(Some("element"), 0x18, None, false),
                ],
            },
            StructLayout {
                name: "LinkNode<Agent>".to_string(),
                size: 0x10,
                fields: vec![
                    field(Some("previous_"), 0x00, None, false),
                    field(Some("next_"), 0x08, None, false),
                ],
            },
        ])
    }

    #[test]
    fn test_nested_field_path() {
        let layouts = layouts();
        assert_eq!(layouts.field_offset("fiber::TaskMeta", "tid"), Ok(0x08));
        assert_eq!(layouts.field_offset("fiber::TaskMeta", "attr.stack_type"), Ok(0x24));
        assert_eq!(layouts.size_of("fiber::TaskMeta"), Ok(0x80));
    }

    #[test]
    fn test_field_in_base_class() {
        let layouts = layouts();
        assert_eq!(layouts.field_offset("Agent<long,long>", "next_"), Ok(0x08));
        assert_eq!(layouts.field_offset("Agent< long, long >", "element"), Ok(0x18));
    }

    #[test]
    fn test_gcc_builtin_spelling() {
        let layouts = StructLayouts::from_layouts(vec![StructLayout {
            name: "melon::var::detail::AgentCombiner<long int, long int, melon::var::detail::AddTo<long int> >::Agent"
                .to_string(),
            size: 0x30,
            fields: vec![field(Some("next_"), 0x08, None, false)],
        }]);

        let agent = "melon::var::detail::AgentCombiner<long, long, melon::var::detail::AddTo<long> >::Agent";
        assert_eq!(layouts.field_offset(agent, "next_"), Ok(0x08));
        assert_eq!(
            layouts.field_offset(
                "melon::var::detail::AgentCombiner<long,long,melon::var::detail::AddTo<long>>::Agent",
                "next_"
            ),
            Ok(0x08)
        );
    }

    #[test]
    fn test_normalize_builtins() {
        assert_eq!(normalize("Foo<long unsigned int>"), "Foo<unsigned long>");
        assert_eq!(normalize("Foo<unsigned long>"), "Foo<unsigned long>");
        assert_eq!(normalize("Foo<long long int>"), "Foo<long long>");
        assert_eq!(normalize("Foo<short int, signed int>"), "Foo<short,int>");
        assert_eq!(normalize("Foo<unsigned>"), "Foo<unsigned int>");
        assert_eq!(normalize("Foo<unsigned char, char>"), "Foo<unsigned char,char>");
        assert_eq!(normalize("a::Foo<const long int*>"), "a::Foo<const long*>");
        assert_ne!(normalize("Foo<long>"), normalize("Foo<int>"));
    }

    #[test]
    fn test_missing_type_and_field() {
        let layouts = layouts();
        assert_eq!(
            layouts.field_offset("fiber::Missing", "tid"),
            Err(LayoutError::UnknownType("fiber::Missing".to_string()))
        );
        assert_eq!(
            layouts.field_offset("fiber::TaskMeta", "attr.missing"),
            Err(LayoutError::UnknownField {
                type_name: "fiber::FiberAttr".to_string(),
                field: "missing".to_string(),
            })
        );
        // 構造体でないフィールドの先はたどれない
        assert!(layouts.field_offset("fiber::TaskMeta", "tid.value").is_err());
    }
}
