//! プールの要素が生存中のファイバーかの判定

/// スタック種別「スタックなし」
pub const STACK_KIND_NONE: u32 = 0;

/// スレッドIDの上位32bitが世代番号
pub fn generation(thread_id: u64) -> u32 {
    (thread_id >> 32) as u32
}

/// 生存判定
///
/// 制御ブロックは再利用されるたびにバージョンカウンタが進むので、
/// IDに埋め込まれた世代とカウンタが一致するものだけが今のファイバーです。
/// スタック種別が「なし」のものはまだ実行を始めていないので除外します。
pub fn is_live(thread_id: u64, version: u32, stack_kind: u32) -> bool {
    generation(thread_id) == version && stack_kind != STACK_KIND_NONE
}
