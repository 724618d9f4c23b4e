//! 冲突解决：按修改时间的后写优先策略

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};

/// 冲突中胜出的一方
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictWinner {
    /// 本地版本胜出：以刷新后的基础版本重新提交
    Local,
    /// 远程版本胜出：用远程内容覆盖本地
    Remote,
}

impl std::fmt::Display for ConflictWinner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictWinner::Local => write!(f, "local"),
            ConflictWinner::Remote => write!(f, "remote"),
        }
    }
}

/// 参与冲突判定的一方：修改时间（毫秒）+ 内容哈希
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictSide<'a> {
    pub modified_time: i64,
    pub hash: &'a str,
}

impl<'a> ConflictSide<'a> {
    pub fn new(modified_time: i64, hash: &'a str) -> Self {
        Self { modified_time, hash }
    }

    /// 全序比较：先比修改时间，相同时比哈希，保证判定与两端顺序无关
    fn rank(&self, other: &ConflictSide<'_>) -> Ordering {
        self.modified_time
            .cmp(&other.modified_time)
            .then_with(|| self.hash.cmp(other.hash))
    }
}

/// 后写优先。完全相同（时间与哈希都一致）时本地胜出，此时内容本就一致。
pub fn resolve_last_write_wins(local: ConflictSide<'_>, remote: ConflictSide<'_>) -> ConflictWinner {
    match local.rank(&remote) {
        Ordering::Less => ConflictWinner::Remote,
        Ordering::Equal | Ordering::Greater => ConflictWinner::Local,
    }
}

/// 生成冲突副本文件名：`name_conflict_side_时间.ext`
pub fn generate_conflict_name(path: &str, side: &str, timestamp: i64) -> String {
    use chrono::DateTime;

    let dt = DateTime::from_timestamp(timestamp, 0)
        .map(|d| d.format("%Y%m%d_%H%M%S").to_string())
        .unwrap_or_else(|| "unknown".to_string());

    // 只在文件名部分找扩展名，`.bashrc` 这类点文件没有扩展名
    let name_start = path.rfind('/').map_or(0, |i| i + 1);
    match path[name_start..].rfind('.') {
        Some(pos) if pos > 0 => {
            let (name, ext) = path.split_at(name_start + pos);
            format!("{}_conflict_{}_{}{}", name, side, dt, ext)
        }
        _ => format!("{}_conflict_{}_{}", path, side, dt),
    }
}

/// 被远程覆盖前保留的本地副本路径
pub fn conflict_copy_path(path: &Path, timestamp: i64) -> PathBuf {
    PathBuf::from(generate_conflict_name(&path.to_string_lossy(), "local", timestamp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_newer_side_wins() {
        let local = ConflictSide::new(2_000, "aaa");
        let remote = ConflictSide::new(1_000, "bbb");
        assert_eq!(resolve_last_write_wins(local, remote), ConflictWinner::Local);
        assert_eq!(resolve_last_write_wins(remote, local), ConflictWinner::Remote);
    }

    #[test]
    fn test_equal_mtime_breaks_tie_by_hash() {
        let a = ConflictSide::new(1_000, "aaa");
        let b = ConflictSide::new(1_000, "bbb");
        assert_eq!(resolve_last_write_wins(b, a), ConflictWinner::Local);
        assert_eq!(resolve_last_write_wins(a, b), ConflictWinner::Remote);
    }

    #[test]
    fn test_generate_conflict_name() {
        assert_eq!(
            generate_conflict_name("/home/u/.bashrc", "local", 0),
            "/home/u/.bashrc_conflict_local_19700101_000000"
        );
        assert_eq!(
            generate_conflict_name("/home/u/.config/nvim/init.lua", "local", 0),
            "/home/u/.config/nvim/init_conflict_local_19700101_000000.lua"
        );
        assert_eq!(
            generate_conflict_name("/home/u.d/profile", "remote", 0),
            "/home/u.d/profile_conflict_remote_19700101_000000"
        );
    }

    proptest! {
        /// 交换两端后结果恰好相反（内容不同时），即判定与顺序无关
        #[test]
        fn prop_resolution_is_order_independent(
            t1 in 0i64..5,
            t2 in 0i64..5,
            h1 in "[a-c]{2}",
            h2 in "[a-c]{2}",
        ) {
            let x = ConflictSide::new(t1, &h1);
            let y = ConflictSide::new(t2, &h2);
            let forward = resolve_last_write_wins(x, y);
            let backward = resolve_last_write_wins(y, x);

            // x 胜出 ⇔ forward 为 Local 且 backward 为 Remote
            if x == y {
                prop_assert_eq!(forward, ConflictWinner::Local);
                prop_assert_eq!(backward, ConflictWinner::Local);
            } else {
                prop_assert_ne!(forward, backward);
            }
        }
    }
}
