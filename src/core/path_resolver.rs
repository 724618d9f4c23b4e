//! 路径解析：把用户配置的路径规格展开为绝对、去重的文件路径

use crate::error::PathError;
use regex::Regex;
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// 目录展开时跳过的文件/目录名（按单个路径分量匹配）
const DEFAULT_EXCLUDES: &[&str] = &[
    ".git",
    ".svn",
    ".hg",
    ".DS_Store",
    "Thumbs.db",
    "*.swp",
    "*.tmp",
    "*~",
    // 冲突时保留的本地副本
    "*_conflict_*",
    // 恢复远程内容时的临时文件
    "*.dotsync-tmp",
];

/// 单条规格解析后的形态
#[derive(Debug, Clone)]
enum SpecKind {
    File(PathBuf),
    Dir(PathBuf),
    Glob {
        base: PathBuf,
        pattern: Regex,
        recursive: bool,
    },
}

/// 一次解析的结果
#[derive(Debug, Clone, Default)]
pub struct Resolved {
    pub paths: BTreeSet<PathBuf>,
    pub errors: Vec<PathError>,
    specs: Vec<SpecKind>,
}

impl Resolved {
    /// 路径是否仍被某条规格覆盖（用于区分"已删除"与"已移出配置"）
    pub fn covers(&self, path: &Path) -> bool {
        self.specs.iter().any(|spec| match spec {
            SpecKind::File(p) => p == path,
            SpecKind::Dir(dir) => path
                .strip_prefix(dir)
                .map(|rel| !rel.as_os_str().is_empty() && !is_excluded(rel))
                .unwrap_or(false),
            SpecKind::Glob { base, pattern, .. } => path
                .strip_prefix(base)
                .map(|rel| pattern.is_match(&slash_path(rel)))
                .unwrap_or(false),
        })
    }

    /// 文件系统通知需要监听的目录：(目录, 是否递归)
    pub fn watch_roots(&self) -> Vec<(PathBuf, bool)> {
        let mut roots: BTreeSet<(PathBuf, bool)> = BTreeSet::new();
        for spec in &self.specs {
            match spec {
                SpecKind::File(p) => {
                    if let Some(parent) = p.parent() {
                        roots.insert((parent.to_path_buf(), false));
                    }
                }
                SpecKind::Dir(dir) => {
                    roots.insert((dir.clone(), true));
                }
                SpecKind::Glob { base, recursive, .. } => {
                    roots.insert((base.clone(), *recursive));
                }
            }
        }
        roots.into_iter().collect()
    }
}

/// 路径解析器
#[derive(Debug, Clone)]
pub struct PathResolver {
    home: Option<PathBuf>,
    cwd: PathBuf,
}

impl PathResolver {
    pub fn new() -> Self {
        Self {
            home: crate::dirs::home_dir(),
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
        }
    }

    /// 指定 home 与工作目录（测试用）
    pub fn with_dirs(home: Option<PathBuf>, cwd: PathBuf) -> Self {
        Self { home, cwd }
    }

    /// 解析一批规格。单条失败只记录 PathError，不影响其余规格。
    pub fn resolve<S: AsRef<str>>(&self, specs: &[S]) -> Resolved {
        let mut resolved = Resolved::default();

        for raw in specs {
            let spec = raw.as_ref().trim();
            if spec.is_empty() || spec.starts_with('#') {
                continue;
            }

            let path = match self.expand(spec) {
                Ok(p) => p,
                Err(e) => {
                    warn!("跳过无法解析的路径: {}", e);
                    resolved.errors.push(e);
                    continue;
                }
            };

            if has_glob(&path) {
                match compile_glob(&path) {
                    Ok((base, pattern, recursive)) => {
                        for file in expand_glob(&base, &pattern, recursive) {
                            resolved.paths.insert(file);
                        }
                        resolved.specs.push(SpecKind::Glob {
                            base,
                            pattern,
                            recursive,
                        });
                    }
                    Err(reason) => resolved.errors.push(PathError::new(spec, reason)),
                }
            } else if path.is_dir() {
                resolved.paths.extend(expand_dir(&path));
                resolved.specs.push(SpecKind::Dir(path));
            } else {
                // 尚不存在的文件也保留，之后创建时能被检测为 Created
                resolved.paths.insert(path.clone());
                resolved.specs.push(SpecKind::File(path));
            }
        }

        debug!(
            "路径解析完成: {} 个文件, {} 个错误",
            resolved.paths.len(),
            resolved.errors.len()
        );
        resolved
    }

    /// 展开 `~`、转为绝对路径并做词法规范化
    fn expand(&self, spec: &str) -> Result<PathBuf, PathError> {
        let path = if spec == "~" || spec.starts_with("~/") {
            let home = self
                .home
                .as_ref()
                .ok_or_else(|| PathError::new(spec, "home directory cannot be determined"))?;
            match spec.strip_prefix("~/") {
                Some(rest) => home.join(rest),
                None => home.clone(),
            }
        } else if spec.starts_with('~') {
            return Err(PathError::new(spec, "user-relative paths (~user) are not supported"));
        } else {
            let p = PathBuf::from(spec);
            if p.is_absolute() {
                p
            } else {
                self.cwd.join(p)
            }
        };

        Ok(normalize(&path))
    }
}

impl Default for PathResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// 可在运行时替换的跟踪规格集合
pub struct TrackedPaths {
    specs: RwLock<Vec<String>>,
    resolver: PathResolver,
}

impl TrackedPaths {
    pub fn new(specs: Vec<String>, resolver: PathResolver) -> Self {
        Self {
            specs: RwLock::new(specs),
            resolver,
        }
    }

    /// 按当前规格重新解析（目录和通配符的新文件由此被发现）
    pub async fn resolve(&self) -> Resolved {
        let specs = self.specs.read().await.clone();
        self.resolver.resolve(&specs)
    }

    pub async fn set_specs(&self, specs: Vec<String>) {
        *self.specs.write().await = specs;
    }

    pub async fn specs(&self) -> Vec<String> {
        self.specs.read().await.clone()
    }
}

/// 词法规范化：去掉 `.`，`..` 回退一级，末尾 `/` 自然消失
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn is_glob_segment(segment: &str) -> bool {
    segment.contains(['*', '?', '['])
}

fn has_glob(path: &Path) -> bool {
    path.components()
        .any(|c| is_glob_segment(&c.as_os_str().to_string_lossy()))
}

/// 通配符转正则：`**` 跨目录，`*`/`?` 不跨 `/`，`[...]` 原样保留
fn glob_to_regex(pattern: &str) -> String {
    let mut regex = String::from("^");
    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                // `**/` 可以匹配零层目录
                if chars.get(i + 2) == Some(&'/') {
                    regex.push_str("(?:.*/)?");
                    i += 3;
                } else {
                    regex.push_str(".*");
                    i += 2;
                }
                continue;
            }
            '*' => regex.push_str("[^/]*"),
            '?' => regex.push_str("[^/]"),
            '[' => match chars[i..].iter().position(|&c| c == ']') {
                Some(end) => {
                    let class: String = chars[i + 1..i + end].iter().collect();
                    regex.push('[');
                    match class.strip_prefix('!') {
                        Some(negated) => {
                            regex.push('^');
                            regex.push_str(negated);
                        }
                        None => regex.push_str(&class),
                    }
                    regex.push(']');
                    i += end + 1;
                    continue;
                }
                None => regex.push_str(r"\["),
            },
            c => regex.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }

    regex.push('$');
    regex
}

/// 拆分为 (不含通配符的基目录, 相对模式正则, 是否递归)
fn compile_glob(path: &Path) -> Result<(PathBuf, Regex, bool), String> {
    let mut base = PathBuf::new();
    let mut rest: Vec<String> = Vec::new();

    for component in path.components() {
        let segment = component.as_os_str().to_string_lossy().to_string();
        if rest.is_empty() && !is_glob_segment(&segment) {
            base.push(component.as_os_str());
        } else {
            rest.push(segment);
        }
    }

    let pattern = rest.join("/");
    let recursive = pattern.contains("**");
    let regex = Regex::new(&glob_to_regex(&pattern)).map_err(|e| format!("invalid glob: {}", e))?;
    Ok((base, regex, recursive || rest.len() > 1))
}

fn is_excluded_name(name: &str) -> bool {
    DEFAULT_EXCLUDES.iter().any(|pattern| {
        if is_glob_segment(pattern) {
            Regex::new(&glob_to_regex(pattern))
                .map(|re| re.is_match(name))
                .unwrap_or(false)
        } else {
            name == *pattern
        }
    })
}

fn is_excluded(relative: &Path) -> bool {
    relative
        .components()
        .any(|c| is_excluded_name(&c.as_os_str().to_string_lossy()))
}

/// 递归列出目录下所有普通文件（不跟随符号链接）
fn expand_dir(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0 || !is_excluded_name(&entry.file_name().to_string_lossy())
        })
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect()
}

fn expand_glob(base: &Path, pattern: &Regex, recursive: bool) -> Vec<PathBuf> {
    if !base.is_dir() {
        return Vec::new();
    }

    let walker = WalkDir::new(base).follow_links(false).min_depth(1);
    let walker = if recursive { walker } else { walker.max_depth(1) };

    walker
        .into_iter()
        .filter_entry(|entry| !is_excluded_name(&entry.file_name().to_string_lossy()))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .strip_prefix(base)
                .map(|rel| pattern.is_match(&slash_path(rel)))
                .unwrap_or(false)
        })
        .map(|e| e.into_path())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn resolver(home: &Path) -> PathResolver {
        PathResolver::with_dirs(Some(home.to_path_buf()), home.join("work"))
    }

    #[test]
    fn test_home_expansion_and_normalization() {
        let home = PathBuf::from("/home/u");
        let r = resolver(&home).resolve(&["~", "~/.vimrc", "~/.config/nvim/", "~/./a/../.zshrc"]);

        assert!(r.errors.is_empty());
        let paths: Vec<_> = r.paths.iter().cloned().collect();
        assert!(paths.contains(&PathBuf::from("/home/u")));
        assert!(paths.contains(&PathBuf::from("/home/u/.vimrc")));
        assert!(paths.contains(&PathBuf::from("/home/u/.config/nvim")));
        assert!(paths.contains(&PathBuf::from("/home/u/.zshrc")));
    }

    #[test]
    fn test_relative_specs_and_dedup() {
        let home = PathBuf::from("/home/u");
        let r = resolver(&home).resolve(&["notes.txt", "/home/u/work/notes.txt", "./notes.txt", ""]);
        assert_eq!(r.paths.len(), 1);
        assert!(r.paths.contains(&PathBuf::from("/home/u/work/notes.txt")));
    }

    #[test]
    fn test_missing_home_is_partial_failure() {
        let r = PathResolver::with_dirs(None, PathBuf::from("/tmp"))
            .resolve(&["~/.vimrc", "/etc/hosts", "~bob/.profile", "# comment"]);

        assert_eq!(r.errors.len(), 2);
        assert_eq!(r.errors[0].spec, "~/.vimrc");
        assert_eq!(r.errors[1].spec, "~bob/.profile");
        assert_eq!(r.paths.len(), 1);
    }

    #[test]
    fn test_directory_and_glob_expansion() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path();
        let nvim = home.join(".config/nvim");
        fs::create_dir_all(nvim.join("lua")).unwrap();
        fs::create_dir_all(nvim.join(".git")).unwrap();
        fs::write(nvim.join("init.lua"), "-- init").unwrap();
        fs::write(nvim.join("lua/plugins.lua"), "return {}").unwrap();
        fs::write(nvim.join(".git/HEAD"), "ref").unwrap();
        fs::write(nvim.join("init.lua.swp"), "x").unwrap();
        fs::write(home.join(".bashrc"), "x").unwrap();
        fs::write(home.join(".bash_profile"), "x").unwrap();
        fs::write(home.join(".zshrc"), "x").unwrap();

        let r = resolver(home).resolve(&["~/.config/nvim", "~/.bash*"]);
        assert!(r.errors.is_empty());

        let expected: BTreeSet<PathBuf> = [
            nvim.join("init.lua"),
            nvim.join("lua/plugins.lua"),
            home.join(".bashrc"),
            home.join(".bash_profile"),
        ]
        .into_iter()
        .collect();
        assert_eq!(r.paths, expected);

        assert!(r.covers(&nvim.join("lua/new.lua")));
        assert!(!r.covers(&nvim.join(".git/config")));
        assert!(r.covers(&home.join(".bash_logout")));
        assert!(!r.covers(&home.join(".zshrc")));
    }

    #[test]
    fn test_recursive_glob() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::write(root.join("top.conf"), "").unwrap();
        fs::write(root.join("a/b/deep.conf"), "").unwrap();
        fs::write(root.join("a/b/deep.txt"), "").unwrap();

        let spec = format!("{}/**/*.conf", root.display());
        let r = resolver(root).resolve(&[spec]);
        assert_eq!(r.paths.len(), 2);
        assert!(r.paths.contains(&root.join("top.conf")));
        assert!(r.paths.contains(&root.join("a/b/deep.conf")));
    }

    #[test]
    fn test_glob_to_regex() {
        let re = Regex::new(&glob_to_regex("*.rc")).unwrap();
        assert!(re.is_match("bash.rc"));
        assert!(!re.is_match("dir/bash.rc"));

        let re = Regex::new(&glob_to_regex("[!.]*")).unwrap();
        assert!(re.is_match("vimrc"));
        assert!(!re.is_match(".vimrc"));

        assert!(is_excluded_name("init.lua.swp"));
        assert!(is_excluded_name(".bashrc_conflict_local_20240101_120000"));
        assert!(!is_excluded_name(".bashrc"));
    }

    #[test]
    fn test_watch_roots() {
        let home = PathBuf::from("/home/u");
        let r = resolver(&home).resolve(&["~/.vimrc", "~/.zshrc"]);
        assert_eq!(r.watch_roots(), vec![(home, false)]);
    }
}
