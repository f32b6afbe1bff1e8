//! ランタイムごとのシンボル名・型名の表
//!
//! フィールドのオフセットは直接持たず、型名とフィールドパスだけを持ちます。
//! 実際のオフセットは対象バイナリのDWARFから解決するので、
//! ランタイムのビルド設定が変わっても表を書き換える必要はありません。

use std::fmt;

/// シンボルの探し方
///
/// `candidates` を順に完全一致で探し、見つからなければ `pattern`（正規表現）で
/// シンボルテーブルを検索します。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolSpec {
    pub candidates: &'static [&'static str],
    pub pattern: Option<&'static str>,
}

impl fmt::Display for SymbolSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.candidates.first(), self.pattern) {
            (Some(name), _) => write!(f, "{}", name),
            (None, Some(pattern)) => write!(f, "/{}/", pattern),
            (None, None) => write!(f, "<unnamed>"),
        }
    }
}

/// 型名とその中のフィールドパス
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldRef {
    pub type_name: &'static str,
    pub path: &'static str,
}

impl FieldRef {
    pub const fn new(type_name: &'static str, path: &'static str) -> Self {
        Self { type_name, path }
    }
}

/// ファイバーランタイムの構成
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeProfile {
    pub name: &'static str,
    pub description: &'static str,

    /// スケジューラ制御ブロックのグローバル変数
    pub task_control: SymbolSpec,
    /// グローバル変数が制御ブロックへのポインタか（falseなら制御ブロックそのもの）
    pub task_control_is_pointer: bool,
    /// スケジューラ制御ブロックの型名
    pub task_control_type: &'static str,
    /// 生存数カウンタの基底値
    pub counter_base: FieldRef,
    /// シャードリングの番兵ノード
    pub counter_root: FieldRef,
    /// シャードの次ノードポインタ
    pub shard_next: FieldRef,
    /// シャードの値
    pub shard_value: FieldRef,

    /// 使用中グループ数
    pub pool_group_count: SymbolSpec,
    /// グループポインタ配列
    pub pool_groups: SymbolSpec,
    pub group_block_count: FieldRef,
    pub group_blocks: FieldRef,
    pub block_item_count: FieldRef,
    pub block_items: FieldRef,

    /// 制御ブロック（プールの要素）の型名
    pub control_block_type: &'static str,
    pub meta_tid: FieldRef,
    pub meta_version_counter: FieldRef,
    pub meta_stack_kind: FieldRef,
    pub meta_stack: FieldRef,
    pub meta_entry: FieldRef,
    /// スタックハンドル内の保存コンテキストへのポインタ
    pub stack_context: FieldRef,
}

const MELON_TASK_CONTROL: &str = "fiber::TaskControl";
const MELON_AGENT: &str =
    "melon::var::detail::AgentCombiner<long, long, melon::var::detail::AddTo<long> >::Agent";
const MELON_GROUP: &str = "mutil::ResourcePool<fiber::TaskMeta>::BlockGroup";
const MELON_BLOCK: &str = "mutil::ResourcePool<fiber::TaskMeta>::Block";
const MELON_META: &str = "fiber::TaskMeta";
const MELON_STACK: &str = "fiber::ContextualStack";

pub const MELON: RuntimeProfile = RuntimeProfile {
    name: "melon",
    description: "melon fiber runtime (fiber::, mutil::ResourcePool)",
    task_control: SymbolSpec {
        candidates: &["fiber::g_task_control", "_ZN5fiber14g_task_controlE"],
        pattern: Some(r"g_task_control(E)?$"),
    },
    task_control_is_pointer: true,
    task_control_type: MELON_TASK_CONTROL,
    counter_base: FieldRef::new(MELON_TASK_CONTROL, "_nfibers._combiner._global_result"),
    counter_root: FieldRef::new(MELON_TASK_CONTROL, "_nfibers._combiner._agents.root_"),
    shard_next: FieldRef::new(MELON_AGENT, "next_"),
    shard_value: FieldRef::new(MELON_AGENT, "element._value"),
    pool_group_count: SymbolSpec {
        candidates: &[
            "mutil::ResourcePool<fiber::TaskMeta>::_ngroup",
            "_ZN5mutil12ResourcePoolIN5fiber8TaskMetaEE7_ngroupE",
        ],
        pattern: Some(r"ResourcePool.*TaskMeta.*_ngroup"),
    },
    pool_groups: SymbolSpec {
        candidates: &[
            "mutil::ResourcePool<fiber::TaskMeta>::_block_groups",
            "_ZN5mutil12ResourcePoolIN5fiber8TaskMetaEE13_block_groupsE",
        ],
        pattern: Some(r"ResourcePool.*TaskMeta.*_block_groups"),
    },
    group_block_count: FieldRef::new(MELON_GROUP, "nblock"),
    group_blocks: FieldRef::new(MELON_GROUP, "blocks"),
    block_item_count: FieldRef::new(MELON_BLOCK, "nitem"),
    block_items: FieldRef::new(MELON_BLOCK, "items"),
    control_block_type: MELON_META,
    meta_tid: FieldRef::new(MELON_META, "tid"),
    meta_version_counter: FieldRef::new(MELON_META, "version_butex"),
    meta_stack_kind: FieldRef::new(MELON_META, "attr.stack_type"),
    meta_stack: FieldRef::new(MELON_META, "stack"),
    meta_entry: FieldRef::new(MELON_META, "fn"),
    stack_context: FieldRef::new(MELON_STACK, "context"),
};

const BTHREAD_TASK_CONTROL: &str = "bthread::TaskControl";
const BTHREAD_AGENT: &str =
    "bvar::detail::AgentCombiner<long, long, bvar::detail::AddTo<long> >::Agent";
const BTHREAD_GROUP: &str = "butil::ResourcePool<bthread::TaskMeta>::BlockGroup";
const BTHREAD_BLOCK: &str = "butil::ResourcePool<bthread::TaskMeta>::Block";
const BTHREAD_META: &str = "bthread::TaskMeta";
const BTHREAD_STACK: &str = "bthread::ContextualStack";

pub const BTHREAD: RuntimeProfile = RuntimeProfile {
    name: "bthread",
    description: "brpc bthread runtime (bthread::, butil::ResourcePool)",
    task_control: SymbolSpec {
        candidates: &["bthread::g_task_control", "_ZN7bthread14g_task_controlE"],
        pattern: Some(r"bthread.*g_task_control"),
    },
    task_control_is_pointer: true,
    task_control_type: BTHREAD_TASK_CONTROL,
    counter_base: FieldRef::new(BTHREAD_TASK_CONTROL, "_nbthreads._combiner._global_result"),
    counter_root: FieldRef::new(BTHREAD_TASK_CONTROL, "_nbthreads._combiner._agents.root_"),
    shard_next: FieldRef::new(BTHREAD_AGENT, "next_"),
    shard_value: FieldRef::new(BTHREAD_AGENT, "element._value"),
    pool_group_count: SymbolSpec {
        candidates: &[
            "butil::ResourcePool<bthread::TaskMeta>::_ngroup",
            "_ZN5butil12ResourcePoolIN7bthread8TaskMetaEE7_ngroupE",
        ],
        pattern: Some(r"ResourcePool.*bthread.*TaskMeta.*_ngroup"),
    },
    pool_groups: SymbolSpec {
        candidates: &[
            "butil::ResourcePool<bthread::TaskMeta>::_block_groups",
            "_ZN5butil12ResourcePoolIN7bthread8TaskMetaEE13_block_groupsE",
        ],
        pattern: Some(r"ResourcePool.*bthread.*TaskMeta.*_block_groups"),
    },
    group_block_count: FieldRef::new(BTHREAD_GROUP, "nblock"),
    group_blocks: FieldRef::new(BTHREAD_GROUP, "blocks"),
    block_item_count: FieldRef::new(BTHREAD_BLOCK, "nitem"),
    block_items: FieldRef::new(BTHREAD_BLOCK, "items"),
    control_block_type: BTHREAD_META,
    meta_tid: FieldRef::new(BTHREAD_META, "tid"),
    meta_version_counter: FieldRef::new(BTHREAD_META, "version_butex"),
    meta_stack_kind: FieldRef::new(BTHREAD_META, "attr.stack_type"),
    meta_stack: FieldRef::new(BTHREAD_META, "stack"),
    meta_entry: FieldRef::new(BTHREAD_META, "fn"),
    stack_context: FieldRef::new(BTHREAD_STACK, "context"),
};

/// 組み込みのプロファイル
pub const PROFILES: &[RuntimeProfile] = &[MELON, BTHREAD];

impl RuntimeProfile {
    /// 名前からプロファイルを探す
    pub fn by_name(name: &str) -> Option<&'static RuntimeProfile> {
        PROFILES.iter().find(|p| p.name.eq_ignore_ascii_case(name))
    }
}

impl Default for RuntimeProfile {
    fn default() -> Self {
        MELON
    }
}
