// Copyright (c) 2025, vistone
// All rights reserved.

/// EntryState 池条目状态
/// 状态只允许通过原子 CAS 迁移，合法迁移为：
/// NotInUse→InUse、NotInUse→Reserved、InUse→NotInUse、
/// Reserved→Removed、Reserved→NotInUse，以及任意状态→Removed（终态）。
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum EntryState {
    /// StateNotInUse 空闲，位于共享列表中可被借出
    #[default]
    NotInUse = 0,
    /// StateInUse 已被借出
    InUse = 1,
    /// StateRemoved 已移除（终态）
    Removed = -1,
    /// StateReserved 被后台维护临时占用，等待移除或放回
    Reserved = -2,
}

impl EntryState {
    /// from_i32 从原子存储值还原状态
    pub fn from_i32(value: i32) -> Option<EntryState> {
        match value {
            0 => Some(EntryState::NotInUse),
            1 => Some(EntryState::InUse),
            -1 => Some(EntryState::Removed),
            -2 => Some(EntryState::Reserved),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryState::NotInUse => write!(f, "not-in-use"),
            EntryState::InUse => write!(f, "in-use"),
            EntryState::Removed => write!(f, "removed"),
            EntryState::Reserved => write!(f, "reserved"),
        }
    }
}
