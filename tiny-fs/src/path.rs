//! # 路径解析层
//!
//! 把路径拆成 `(父目录 inode, 末项名)`：`/a/b/c` 给出 `/a/b` 的
//! inode 和 `"c"`。末项可以不存在——创建类调用者正需要这种
//! “缺失项的父目录”；中间项缺失则整体失败。
//!
//! `.` 与 `..` 靠目录建立时插入的两项解析，这里没有它们的分支。

use std::sync::Arc;

use crate::dir::Dir;
use crate::filesys::FsCore;
use crate::inode::Inode;
use crate::{NAME_MAX, PATH_MAX};

/// 解析结果：已打开的父目录 inode（调用者负责关闭）与末项名。
pub(crate) fn find_dir(
    core: &Arc<FsCore>,
    cwd: &Dir,
    path: &str,
) -> Option<(Arc<Inode>, String)> {
    if path.is_empty() || path.len() > PATH_MAX {
        return None;
    }

    // 连续的 `/` 折叠成一个
    let mut name = String::with_capacity(path.len());
    for c in path.chars() {
        if c == '/' && name.ends_with('/') {
            continue;
        }
        name.push(c);
    }

    // 绝对路径从根出发，相对路径从调用者的工作目录出发；
    // 重开一个句柄让本次遍历独占所有权
    let mut dir = if name.starts_with('/') {
        Dir::open_root(core)
    } else {
        cwd.reopen()
    };

    let mut parent = dir.inode().reopen();
    let mut last_name = String::from(".");
    let mut not_found = false;

    for token in name.split('/').filter(|token| !token.is_empty()) {
        // 上一项就没找到，说明缺的是中间项
        if not_found || token.len() > NAME_MAX {
            parent.close();
            return None;
        }

        parent.close();
        parent = dir.inode().reopen();
        last_name = token.to_owned();

        match dir.lookup(token) {
            Some(next) => dir = Dir::open(next),
            None => not_found = true,
        }
    }

    Some((parent, last_name))
}
